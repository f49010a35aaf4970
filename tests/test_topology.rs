//! Tests for topology documents, cycle validation and forward ordering
//!
//! This file exercises components the way a topology document builds them:
//! - cycle detection and declared cycles
//! - forward order of glues around cycles
//! - multi-component models built from JSON

use approx::assert_relative_eq;
use rust_neural_lm::component::{Component, ComponentBuilder, GlueSpec};
use rust_neural_lm::glues::GlueKind;
use rust_neural_lm::layers::{Combine, LayerKind};
use rust_neural_lm::model::Model;
use rust_neural_lm::topology::{load_topology, parse_topology};
use rust_neural_lm::utils::SimpleRng;
use rust_neural_lm::vocab::{Vocab, Vocabulary};
use rust_neural_lm::LmError;

/// input → h1 ⇄ h2 → output
fn two_layer_loop() -> ComponentBuilder {
    Component::builder("loop", 5, 6)
        .add_layer("h1", 4, LayerKind::Tanh, Combine::Sum)
        .add_layer("h2", 4, LayerKind::Sigmoid, Combine::Sum)
        .add_glue(GlueSpec::new("emb", GlueKind::Embedding, "input", "h1"))
        .add_glue(GlueSpec::new("fwd", GlueKind::FullyConnected, "h1", "h2"))
        .add_glue(GlueSpec::new("back", GlueKind::FullyConnected, "h2", "h1"))
        .add_glue(GlueSpec::new("out", GlueKind::Output, "h2", "output"))
}

fn names(comp: &Component, glues: &[usize]) -> Vec<String> {
    glues.iter().map(|&g| comp.glues()[g].name.clone()).collect()
}

/// Every non-head glue runs after every glue writing into its source.
fn assert_forward_order(comp: &Component) {
    let order = comp.forward_order();
    assert_eq!(order.len(), comp.glues().len());
    let position = |g: usize| order.iter().position(|&x| x == g).unwrap();
    for (g, glue) in comp.glues().iter().enumerate() {
        if comp.is_head(g) {
            continue;
        }
        for (w, writer) in comp.glues().iter().enumerate() {
            if writer.dst == glue.src {
                assert!(
                    position(w) < position(g),
                    "'{}' must run before '{}'",
                    writer.name,
                    glue.name
                );
            }
        }
    }
}

// ============================================================================
// Cycle Detection Tests
// ============================================================================

mod cycle_tests {
    use super::*;

    #[test]
    fn test_detected_cycle_is_headed_by_closing_glue() {
        let comp = two_layer_loop().build(&mut SimpleRng::new(1)).unwrap();
        assert_eq!(comp.cycles().len(), 1);
        assert_eq!(names(&comp, &comp.cycles()[0]), vec!["back", "fwd"]);
        assert_forward_order(&comp);
    }

    #[test]
    fn test_declared_cycle_may_choose_other_head() {
        let comp = two_layer_loop()
            .with_cycles(vec![vec!["fwd".to_string(), "back".to_string()]])
            .build(&mut SimpleRng::new(1))
            .unwrap();
        assert_eq!(names(&comp, &comp.cycles()[0]), vec!["fwd", "back"]);
        assert!(comp.is_head(1));
        assert!(!comp.is_head(2));
        assert_forward_order(&comp);
    }

    #[test]
    fn test_open_declared_cycle_is_rejected() {
        let err = two_layer_loop()
            .with_cycles(vec![vec!["back".to_string()]])
            .build(&mut SimpleRng::new(1))
            .unwrap_err();
        assert!(matches!(err, LmError::Cycle { .. }), "{}", err);
    }

    #[test]
    fn test_unknown_glue_in_cycle_is_rejected() {
        let err = two_layer_loop()
            .with_cycles(vec![vec!["missing".to_string(), "fwd".to_string()]])
            .build(&mut SimpleRng::new(1))
            .unwrap_err();
        assert!(matches!(err, LmError::Cycle { .. }));
        assert!(err.is_structural());
    }

    #[test]
    fn test_direct_glue_may_close_a_cycle() {
        let comp = Component::builder("d", 5, 6)
            .add_layer("h", 3, LayerKind::Sigmoid, Combine::Avg)
            .add_glue(GlueSpec::new("emb", GlueKind::Embedding, "input", "h"))
            .add_glue(GlueSpec::new("copy", GlueKind::Direct, "h", "h"))
            .add_glue(GlueSpec::new("out", GlueKind::Output, "h", "output"))
            .build(&mut SimpleRng::new(1))
            .unwrap();
        assert_eq!(comp.cycles(), &[vec![1]]);
        // two writers averaged
        assert_relative_eq!(comp.in_scale(2), 0.5);
    }

    #[test]
    fn test_feedforward_component_has_no_cycles() {
        let comp = Component::builder("ff", 5, 6)
            .set_input(vec![-2, -1], Combine::Concat)
            .add_layer("proj", 6, LayerKind::Linear, Combine::Concat)
            .add_layer("hidden", 4, LayerKind::Tanh, Combine::Sum)
            .add_glue(GlueSpec::new("emb", GlueKind::Embedding, "input", "proj"))
            .add_glue(GlueSpec::new("fc", GlueKind::FullyConnected, "proj", "hidden"))
            .add_glue(GlueSpec::new("out", GlueKind::Output, "hidden", "output"))
            .build(&mut SimpleRng::new(1))
            .unwrap();
        assert!(comp.cycles().is_empty());
        assert_eq!(comp.forward_order(), &[0, 1, 2]);
        assert_eq!(comp.glues()[0].weight().cols(), 3);
    }
}

// ============================================================================
// Topology Document Tests
// ============================================================================

mod document_tests {
    use super::*;

    const TWO_COMPONENTS: &str = r#"{
        "output": { "max_branch": 3 },
        "components": [
            {
                "name": "rnn",
                "layers": [
                    { "name": "h1", "size": 5, "type": "sigmoid" },
                    { "name": "h2", "size": 4, "type": "tanh" }
                ],
                "glues": [
                    { "name": "emb", "type": "embedding", "src": "input", "dst": "h1" },
                    { "name": "fwd", "type": "fc", "src": "h1", "dst": "h2" },
                    { "name": "back", "type": "fc", "src": "h2", "dst": "h1" },
                    { "name": "out", "type": "output", "src": "h2", "dst": "output" }
                ],
                "cycles": [["back", "fwd"]]
            },
            {
                "name": "ngram",
                "scale": 0.5,
                "input": { "context": [-2, -1], "combine": "concat" },
                "layers": [{ "name": "proj", "size": 6, "type": "linear", "combine": "concat" }],
                "glues": [
                    { "name": "emb", "type": "embedding", "src": "input", "dst": "proj", "size": 3 },
                    { "name": "out", "type": "output", "src": "proj", "dst": "output", "update": "segment", "segment_rows": 2 }
                ]
            }
        ]
    }"#;

    fn vocab() -> Vocab {
        Vocab::from_words(["w1", "w2", "w3", "w4", "w5"])
    }

    #[test]
    fn test_model_from_document() {
        let config = parse_topology(TWO_COMPONENTS).unwrap();
        let model = Model::from_topology(&config, vocab(), &mut SimpleRng::new(4)).unwrap();
        assert_eq!(model.components().len(), 2);

        let rnn = model.component("rnn").unwrap();
        assert_eq!(names(rnn, &rnn.cycles()[0]), vec!["back", "fwd"]);
        assert_forward_order(rnn);

        let ngram = model.component("ngram").unwrap();
        assert_relative_eq!(ngram.scale(), 0.5);
        assert_eq!(ngram.input().context, vec![-2, -1]);
        let out = ngram.glues()[1].weight();
        assert_eq!(out.rows(), model.output_tree().num_nodes());
        assert_eq!(out.num_blocks(), out.rows().div_ceil(2));
    }

    #[test]
    fn test_first_token_distribution_sums_to_one() {
        let config = parse_topology(TWO_COMPONENTS).unwrap();
        let model = Model::from_topology(&config, vocab(), &mut SimpleRng::new(4)).unwrap();
        let total: f64 = (0..model.vocab().size() as u32)
            .map(|w| model.forward(&[w])[0].exp())
            .sum();
        assert_relative_eq!(total, 1.0, epsilon = 1e-5);
    }

    #[test]
    fn test_bad_documents_are_structural_errors() {
        let unknown_layer = TWO_COMPONENTS.replace("\"dst\": \"h2\" }", "\"dst\": \"h9\" }");
        let config = parse_topology(&unknown_layer);
        let built = config.and_then(|c| Model::from_topology(&c, vocab(), &mut SimpleRng::new(1)));
        assert!(built.unwrap_err().is_structural());

        let bad_cycle = TWO_COMPONENTS.replace("[[\"back\", \"fwd\"]]", "[[\"fwd\"]]");
        let config = parse_topology(&bad_cycle);
        let built = config.and_then(|c| Model::from_topology(&c, vocab(), &mut SimpleRng::new(1)));
        assert!(matches!(built, Err(LmError::Cycle { .. })));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("net.json");
        std::fs::write(&path, TWO_COMPONENTS).unwrap();
        let config = load_topology(&path).unwrap();
        assert_eq!(config.components.len(), 2);
        assert!(load_topology(dir.path().join("missing.json")).is_err());
    }
}
