//! One Shared Weight Updater per distinct weight of a model.

use crate::model::Model;
use crate::weights::{SharedWeightUpdater, UpdateParams};
use std::sync::Arc;

/// Maps every weighted glue of every component to the updater of its
/// weight. Tied glues map to the same updater.
pub struct UpdaterTable {
    updaters: Vec<SharedWeightUpdater>,
    /// `index[component][glue]`
    index: Vec<Vec<Option<usize>>>,
}

impl UpdaterTable {
    pub fn new(model: &Model, params: UpdateParams, num_threads: usize) -> Self {
        let mut updaters: Vec<SharedWeightUpdater> = Vec::new();
        let index = model
            .components()
            .iter()
            .map(|comp| {
                comp.glues()
                    .iter()
                    .map(|glue| {
                        let weight = glue.weight.as_ref()?;
                        let existing = updaters.iter().position(|u| Arc::ptr_eq(u.weight(), weight));
                        if existing.is_some() {
                            return existing;
                        }
                        updaters.push(SharedWeightUpdater::new(
                            Arc::clone(weight),
                            params,
                            num_threads,
                        ));
                        Some(updaters.len() - 1)
                    })
                    .collect()
            })
            .collect();
        Self { updaters, index }
    }

    /// Updater of glue `glue` in component `component`; `None` for direct glues.
    pub fn for_glue(&self, component: usize, glue: usize) -> Option<&SharedWeightUpdater> {
        self.index[component][glue].map(|i| &self.updaters[i])
    }

    pub fn updaters(&self) -> &[SharedWeightUpdater] {
        &self.updaters
    }

    pub fn len(&self) -> usize {
        self.updaters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.updaters.is_empty()
    }

    /// Counts one token for thread `tid` on every updater.
    pub fn step(&self, tid: usize) -> usize {
        self.updaters.iter().map(|u| u.step(tid)).sum()
    }

    /// Applies thread `tid`'s staged deltas on every weight.
    pub fn flush(&self, tid: usize) -> usize {
        self.updaters.iter().map(|u| u.flush(tid)).sum()
    }

    /// Applies every thread's staged deltas.
    pub fn flush_all(&self) -> usize {
        self.updaters.iter().map(|u| u.flush_all()).sum()
    }

    pub fn forced_flushes(&self) -> usize {
        self.updaters.iter().map(|u| u.forced_flushes()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::GlueSpec;
    use crate::glues::GlueKind;
    use crate::layers::{Combine, LayerKind};
    use crate::utils::SimpleRng;
    use crate::vocab::Vocab;

    #[test]
    fn test_tied_glues_share_one_updater() {
        let mut model = Model::new(Vocab::from_words(["x", "y"]), None).unwrap();
        let comp = model
            .component_builder("c")
            .add_layer("a", 2, LayerKind::Tanh, Combine::Sum)
            .add_layer("b", 2, LayerKind::Tanh, Combine::Sum)
            .add_glue(GlueSpec::new("emb", GlueKind::Embedding, "input", "a"))
            .add_glue(GlueSpec::new("ab", GlueKind::FullyConnected, "a", "b"))
            .add_glue(GlueSpec::new("bb", GlueKind::FullyConnected, "b", "b").tie("ab"))
            .add_glue(GlueSpec::new("copy", GlueKind::Direct, "a", "b"))
            .add_glue(GlueSpec::new("out", GlueKind::Output, "b", "output"))
            .build(&mut SimpleRng::new(4))
            .unwrap();
        model.add_component(comp).unwrap();

        let table = UpdaterTable::new(&model, UpdateParams::default(), 2);
        assert_eq!(table.len(), 3);
        assert!(table.for_glue(0, 3).is_none());
        let ab = table.for_glue(0, 1).unwrap();
        let bb = table.for_glue(0, 2).unwrap();
        assert!(std::ptr::eq(ab, bb));
        assert_eq!(ab.num_threads(), 2);
        assert_eq!(table.flush_all(), 0);
    }
}
