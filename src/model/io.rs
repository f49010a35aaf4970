//! Model images: saving and loading whole models.
//!
//! An image holds a header, the vocabulary, the output tree parameters and
//! one body per component (input spec, hidden layers, glues, declared
//! cycles). Weight bodies are dense, sparse (non-zero entries only) or
//! 8-bit quantized with a per-row range. Dense and sparse images restore
//! every value bit for bit; quantized images are lossy.
//!
//! The binary format is the magic bytes followed by a bincode body; the
//! text format is the same image as JSON.

use super::Model;
use crate::component::{Component, GlueSpec, InputSpec};
use crate::error::{LmError, Result};
use crate::glues::GlueKind;
use crate::layers::{Layer, INPUT_LAYER};
use crate::output::{OutputSpec, OutputTree};
use crate::utils::SimpleRng;
use crate::vocab::Vocab;
use crate::weights::{UpdateGranularity, WeightStore};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

const MAGIC: &[u8; 4] = b"RNLM";
const VERSION: u32 = 1;

/// On-disk representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelFormat {
    Binary,
    Text,
}

/// How weight values are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightEncoding {
    Dense,
    Sparse,
    Quantized,
}

impl FromStr for WeightEncoding {
    type Err = LmError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "dense" => Ok(Self::Dense),
            "sparse" => Ok(Self::Sparse),
            "quantized" | "q8" => Ok(Self::Quantized),
            other => Err(LmError::invalid_option(format!(
                "Unknown weight encoding '{}'. Must be one of: dense, sparse, quantized",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Header {
    magic: String,
    version: u32,
    encoding: WeightEncoding,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum WeightBody {
    Dense(WeightStore),
    Sparse {
        rows: usize,
        cols: usize,
        entries: Vec<(u32, f32)>,
        bias: Option<Vec<f32>>,
    },
    Quantized {
        rows: usize,
        cols: usize,
        row_min: Vec<f32>,
        row_max: Vec<f32>,
        codes: Vec<u8>,
        bias: Option<Vec<f32>>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GlueImage {
    name: String,
    kind: GlueKind,
    src: String,
    dst: String,
    size: Option<usize>,
    update: Option<UpdateGranularity>,
    tie: Option<String>,
    weight: Option<WeightBody>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ComponentImage {
    name: String,
    scale: f32,
    input: InputSpec,
    layers: Vec<Layer>,
    glues: Vec<GlueImage>,
    cycles: Vec<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ModelImage {
    header: Header,
    vocab: Vocab,
    output: OutputSpec,
    components: Vec<ComponentImage>,
}

/// Position of a sparse entry; images address at most `u32::MAX + 1` values
/// per matrix.
fn sparse_index(i: usize) -> Result<u32> {
    u32::try_from(i).map_err(|_| LmError::format(format!("sparse entry {} does not fit in 32 bits", i)))
}

impl WeightBody {
    fn encode(store: WeightStore, encoding: WeightEncoding) -> Result<Self> {
        let body = match encoding {
            WeightEncoding::Dense => Self::Dense(store),
            WeightEncoding::Sparse => {
                let (rows, cols, data, bias) = store.into_parts();
                let entries = data
                    .iter()
                    .enumerate()
                    .filter(|(_, v)| v.to_bits() != 0)
                    .map(|(i, &v)| Ok((sparse_index(i)?, v)))
                    .collect::<Result<Vec<_>>>()?;
                Self::Sparse {
                    rows,
                    cols,
                    entries,
                    bias,
                }
            }
            WeightEncoding::Quantized => {
                let (rows, cols, data, bias) = store.into_parts();
                let mut row_min = Vec::with_capacity(rows);
                let mut row_max = Vec::with_capacity(rows);
                let mut codes = Vec::with_capacity(data.len());
                for row in data.chunks(cols) {
                    let lo = row.iter().copied().fold(f32::INFINITY, f32::min);
                    let hi = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                    let range = hi - lo;
                    codes.extend(row.iter().map(|&v| {
                        if range > 0.0 {
                            ((v - lo) / range * 255.0).round() as u8
                        } else {
                            0
                        }
                    }));
                    row_min.push(lo);
                    row_max.push(hi);
                }
                Self::Quantized {
                    rows,
                    cols,
                    row_min,
                    row_max,
                    codes,
                    bias,
                }
            }
        };
        Ok(body)
    }

    fn decode(self) -> Result<WeightStore> {
        match self {
            Self::Dense(store) => {
                let (rows, cols, data, bias) = store.into_parts();
                WeightStore::from_parts(rows, cols, data, bias)
            }
            Self::Sparse {
                rows,
                cols,
                entries,
                bias,
            } => {
                let mut data = vec![0.0f32; rows * cols];
                for (i, v) in entries {
                    let slot = data
                        .get_mut(i as usize)
                        .ok_or_else(|| LmError::format(format!("sparse entry {} out of range", i)))?;
                    *slot = v;
                }
                WeightStore::from_parts(rows, cols, data, bias)
            }
            Self::Quantized {
                rows,
                cols,
                row_min,
                row_max,
                codes,
                bias,
            } => {
                if row_min.len() != rows || row_max.len() != rows || codes.len() != rows * cols {
                    return Err(LmError::format("quantized weight body has inconsistent sizes"));
                }
                let data = codes
                    .chunks(cols.max(1))
                    .zip(row_min.iter().zip(&row_max))
                    .flat_map(|(row, (&lo, &hi))| {
                        row.iter().map(move |&q| lo + (hi - lo) * q as f32 / 255.0)
                    })
                    .collect();
                WeightStore::from_parts(rows, cols, data, bias)
            }
        }
    }
}

fn component_image(comp: &Component, encoding: WeightEncoding) -> Result<ComponentImage> {
    let layers = comp.layers();
    let glues = comp
        .glues()
        .iter()
        .map(|glue| {
            let size = match glue.kind {
                GlueKind::Embedding => glue.weight.as_ref().map(|w| w.cols()),
                GlueKind::FullyConnected => Some(glue.out_size),
                GlueKind::Direct | GlueKind::Output => None,
            };
            let weight = match (&glue.tie, &glue.weight) {
                (None, Some(w)) => Some(WeightBody::encode(w.snapshot(), encoding)?),
                _ => None,
            };
            Ok(GlueImage {
                name: glue.name.clone(),
                kind: glue.kind,
                src: layers[glue.src].name.clone(),
                dst: layers[glue.dst].name.clone(),
                size,
                update: glue.weight.as_ref().map(|w| w.granularity()),
                tie: glue.tie.clone(),
                weight,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    let cycles = comp
        .cycles()
        .iter()
        .map(|cycle| cycle.iter().map(|&g| comp.glues()[g].name.clone()).collect())
        .collect();

    Ok(ComponentImage {
        name: comp.name().to_string(),
        scale: comp.scale(),
        input: comp.input().clone(),
        layers: layers[INPUT_LAYER + 1..].to_vec(),
        glues,
        cycles,
    })
}

fn build_component(image: ComponentImage, output_size: usize, vocab_size: usize) -> Result<Component> {
    let mut builder = Component::builder(image.name, output_size, vocab_size)
        .scale(image.scale)
        .set_input(image.input.context, image.input.combine);
    for layer in image.layers {
        builder = builder.add_layer(layer.name, layer.size, layer.kind, layer.combine);
    }
    for glue in image.glues {
        if glue.tie.is_none() && glue.kind.has_weight() && glue.weight.is_none() {
            return Err(LmError::format(format!("glue '{}' has no weight body", glue.name)));
        }
        let mut spec = GlueSpec::new(glue.name, glue.kind, glue.src, glue.dst);
        spec.size = glue.size;
        spec.update = glue.update;
        spec.tie = glue.tie;
        spec.weight = glue.weight.map(WeightBody::decode).transpose()?;
        builder = builder.add_glue(spec);
    }
    // every weight is preset, so the generator is never drawn from
    builder.with_cycles(image.cycles).build(&mut SimpleRng::new(0))
}

impl Model {
    /// Encodes the model into an in-memory image.
    pub fn to_bytes(&self, format: ModelFormat, encoding: WeightEncoding) -> Result<Vec<u8>> {
        let image = ModelImage {
            header: Header {
                magic: String::from_utf8_lossy(MAGIC).into_owned(),
                version: VERSION,
                encoding,
            },
            vocab: (*self.vocab).clone(),
            output: self.output.spec(),
            components: self
                .components
                .iter()
                .map(|c| component_image(c, encoding))
                .collect::<Result<_>>()?,
        };
        match format {
            ModelFormat::Binary => {
                let mut bytes = MAGIC.to_vec();
                bincode::serialize_into(&mut bytes, &image)?;
                Ok(bytes)
            }
            ModelFormat::Text => Ok(serde_json::to_vec_pretty(&image)?),
        }
    }

    /// Decodes an image produced by [`Model::to_bytes`]; the format is
    /// detected from the leading bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let image: ModelImage = match bytes.strip_prefix(MAGIC.as_slice()) {
            Some(body) => bincode::deserialize(body)?,
            None => serde_json::from_slice(bytes)?,
        };
        if image.header.magic.as_bytes() != MAGIC {
            return Err(LmError::format(format!("bad magic '{}'", image.header.magic)));
        }
        if image.header.version != VERSION {
            return Err(LmError::format(format!(
                "unsupported version {} (expected {})",
                image.header.version, VERSION
            )));
        }
        if image.output.num_words != image.vocab.words().len() {
            return Err(LmError::shape_mismatch(
                "output tree words",
                image.vocab.words().len(),
                image.output.num_words,
            ));
        }

        let output = Arc::new(OutputTree::from_spec(image.output)?);
        let mut model = Model::with_tree(Arc::new(image.vocab), output);
        let (output_size, vocab_size) = (model.output.num_nodes(), model.vocab.words().len());
        for comp in image.components {
            model.add_component(build_component(comp, output_size, vocab_size)?)?;
        }
        Ok(model)
    }

    /// Writes the model to `path`.
    pub fn save<P: AsRef<Path>>(&self, path: P, format: ModelFormat, encoding: WeightEncoding) -> Result<()> {
        let bytes = self.to_bytes(format, encoding)?;
        fs::write(path.as_ref(), &bytes)?;
        info!(
            path = %path.as_ref().display(),
            bytes = bytes.len(),
            ?format,
            ?encoding,
            "model saved"
        );
        Ok(())
    }

    /// Reads a model written by [`Model::save`].
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let bytes = fs::read(path.as_ref())?;
        let model = Self::from_bytes(&bytes)?;
        info!(
            path = %path.as_ref().display(),
            components = model.components.len(),
            "model loaded"
        );
        Ok(model)
    }
}
