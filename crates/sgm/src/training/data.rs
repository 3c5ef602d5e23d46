//! Protein pair-map data pipeline.
//!
//! Examples are read from a JSON-lines file, filtered by residue count, split
//! into train/test with a seeded shuffle, and served as padded batches drawn
//! with replacement. Batch indices come from an RNG seeded by the training
//! step, so a resumed run sees exactly the batches an uninterrupted run would.

use std::io::BufRead;
use std::path::Path;

use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::TensorData;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::SgmError;

/// `[data]` config section.
#[derive(Config, Debug)]
pub struct DataConfig {
    /// Feature channels per residue pair (e.g. 5 geometric channels).
    #[config(default = 5)]
    pub num_channels: usize,
    /// Padded length `L` of every batch.
    #[config(default = 128)]
    pub max_res_num: usize,
    /// Shorter proteins are dropped at load time.
    #[config(default = 40)]
    pub min_res_num: usize,
    /// JSON-lines dataset file.
    #[config(default = "None")]
    pub dataset_path: Option<String>,
    /// Fraction of examples used for training; the rest is the test split.
    #[config(default = 0.95)]
    pub train_fraction: f64,
}

/// Independent random streams derived from `(seed, step)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RngStream {
    TrainBatch = 1,
    EvalBatch = 2,
    TrainMask = 3,
    EvalMask = 4,
    TrainNoise = 5,
    EvalNoise = 6,
    /// Backend RNG driving dropout masks in a train step.
    Dropout = 7,
    /// Backend RNG driving snapshot sampling noise.
    Sampling = 8,
}

/// Seed for one stream at one training step.
pub fn step_seed(seed: u64, step: usize, stream: RngStream) -> u64 {
    seed ^ (step as u64).wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15)
        ^ (stream as u64).wrapping_mul(0xC2B2_AE3D_27D4_EB4F)
}

/// RNG for one stream at one training step.
pub fn step_rng(seed: u64, step: usize, stream: RngStream) -> StdRng {
    StdRng::seed_from_u64(step_seed(seed, step, stream))
}

/// One protein as stored on disk.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ProteinRecord {
    #[serde(default)]
    pub id: String,
    /// Number of residues `n`.
    pub length: usize,
    /// Pair features, row-major `(C, n, n)`.
    pub coords_6d: Vec<f32>,
    /// Optional secondary-structure channels, row-major `(S, n, n)`.
    #[serde(default)]
    pub ss: Option<Vec<f32>>,
}

impl ProteinRecord {
    fn check(&self, num_channels: usize) -> Result<(), String> {
        let plane = self.length * self.length;
        if self.coords_6d.len() != num_channels * plane {
            return Err(format!(
                "coords_6d has {} values, expected {num_channels}×{}×{}",
                self.coords_6d.len(),
                self.length,
                self.length
            ));
        }
        if let Some(ss) = &self.ss {
            if plane == 0 || ss.len() % plane != 0 {
                return Err(format!("ss has {} values, not a multiple of {plane}", ss.len()));
            }
        }
        Ok(())
    }

    fn ss_channels(&self) -> usize {
        let plane = self.length * self.length;
        match &self.ss {
            Some(ss) if plane > 0 => ss.len() / plane,
            _ => 0,
        }
    }
}

/// In-memory protein dataset.
#[derive(Clone, Debug)]
pub struct ProteinDataset {
    records: Vec<ProteinRecord>,
    num_channels: usize,
}

impl ProteinDataset {
    pub fn new(records: Vec<ProteinRecord>, num_channels: usize) -> Self {
        Self {
            records,
            num_channels,
        }
    }

    /// Load and filter a JSON-lines dataset.
    ///
    /// Proteins outside `[min_res_num, max_res_num]` are skipped; malformed
    /// lines are an error.
    pub fn load_jsonl(path: &Path, config: &DataConfig) -> Result<Self, SgmError> {
        let file = std::fs::File::open(path)?;
        let reader = std::io::BufReader::new(file);

        let mut records = Vec::new();
        let mut skipped = 0usize;
        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: ProteinRecord = serde_json::from_str(&line)?;
            if record.length < config.min_res_num || record.length > config.max_res_num {
                skipped += 1;
                continue;
            }
            record.check(config.num_channels).map_err(|detail| {
                SgmError::InvalidConfig(format!(
                    "{}:{}: {detail}",
                    path.display(),
                    line_no + 1
                ))
            })?;
            records.push(record);
        }

        if records.is_empty() {
            return Err(SgmError::EmptyDataset(format!(
                "no proteins with {}..={} residues in {}",
                config.min_res_num,
                config.max_res_num,
                path.display()
            )));
        }

        tracing::info!(
            records = records.len(),
            skipped,
            path = %path.display(),
            "Loaded protein dataset"
        );
        Ok(Self::new(records, config.num_channels))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[ProteinRecord] {
        &self.records
    }

    pub fn num_channels(&self) -> usize {
        self.num_channels
    }

    /// Seeded train/test split. Both sides get at least one record.
    pub fn split(self, train_fraction: f64, seed: u64) -> Result<(Self, Self), SgmError> {
        let n = self.records.len();
        if n < 2 {
            return Err(SgmError::EmptyDataset(format!(
                "need at least 2 proteins for a train/test split, got {n}"
            )));
        }
        let train_size = ((n as f64 * train_fraction) as usize).clamp(1, n - 1);

        let mut records = self.records;
        records.shuffle(&mut StdRng::seed_from_u64(seed));
        let test = records.split_off(train_size);
        Ok((
            Self::new(records, self.num_channels),
            Self::new(test, self.num_channels),
        ))
    }
}

/// A padded batch of protein pair maps.
#[derive(Clone, Debug)]
pub struct ProteinBatch<B: Backend> {
    /// Pair features `(batch, C, L, L)`.
    pub coords_6d: Tensor<B, 4>,
    /// Residue mask `(batch, L)`, 1 for real residues.
    pub mask: Tensor<B, 2>,
    /// Secondary-structure channels `(batch, S, L, L)`.
    pub ss: Option<Tensor<B, 4>>,
    /// Inpainting mask `(batch, L, L)`, 1 marks the region to generate.
    pub inpaint: Option<Tensor<B, 3>>,
    /// Unpadded residue counts.
    pub lengths: Vec<usize>,
}

impl<B: Backend> ProteinBatch<B> {
    pub fn batch_size(&self) -> usize {
        self.coords_6d.dims()[0]
    }

    /// Check that every mask lines up with the pair feature map.
    pub fn validate(&self) -> Result<(), SgmError> {
        let data = self.coords_6d.dims();
        let [batch, _, rows, cols] = data;
        let mismatch = |mask: Vec<usize>| SgmError::MaskShape {
            mask,
            data: data.to_vec(),
        };

        let mask = self.mask.dims();
        if mask != [batch, rows] || rows != cols {
            return Err(mismatch(mask.to_vec()));
        }
        if let Some(ss) = &self.ss {
            let dims = ss.dims();
            if dims[0] != batch || dims[2] != rows || dims[3] != cols {
                return Err(mismatch(dims.to_vec()));
            }
        }
        if let Some(inpaint) = &self.inpaint {
            let dims = inpaint.dims();
            if dims != [batch, rows, cols] {
                return Err(mismatch(dims.to_vec()));
            }
        }
        if self.lengths.len() != batch {
            return Err(mismatch(vec![self.lengths.len()]));
        }
        Ok(())
    }

    /// Loss mask `(batch, L, L)`: valid residue pairs, restricted to the
    /// inpainting region when one is set.
    pub fn pair_mask(&self) -> Tensor<B, 3> {
        let pair = self.mask.clone().unsqueeze_dim::<3>(2) * self.mask.clone().unsqueeze_dim::<3>(1);
        match &self.inpaint {
            Some(inpaint) => pair * inpaint.clone(),
            None => pair,
        }
    }
}

impl<B: AutodiffBackend> ProteinBatch<B> {
    /// The same batch on the inner (non-autodiff) backend.
    pub fn inner(&self) -> ProteinBatch<B::InnerBackend> {
        ProteinBatch {
            coords_6d: self.coords_6d.clone().inner(),
            mask: self.mask.clone().inner(),
            ss: self.ss.clone().map(|t| t.inner()),
            inpaint: self.inpaint.clone().map(|t| t.inner()),
            lengths: self.lengths.clone(),
        }
    }
}

/// Pad records to `max_res_num` and stack them into a batch.
pub fn collate<B: Backend>(
    records: &[&ProteinRecord],
    num_channels: usize,
    max_res_num: usize,
    device: &B::Device,
) -> ProteinBatch<B> {
    let batch = records.len();
    let l = max_res_num;
    let plane = l * l;

    let mut coords = vec![0.0f32; batch * num_channels * plane];
    let mut mask = vec![0.0f32; batch * l];
    let ss_channels = records.iter().map(|r| r.ss_channels()).max().unwrap_or(0);
    let mut ss = vec![0.0f32; batch * ss_channels * plane];

    for (b, record) in records.iter().enumerate() {
        let n = record.length.min(l);
        for c in 0..num_channels {
            for i in 0..n {
                let src = c * record.length * record.length + i * record.length;
                let dst = ((b * num_channels + c) * l + i) * l;
                coords[dst..dst + n].copy_from_slice(&record.coords_6d[src..src + n]);
            }
        }
        mask[b * l..b * l + n].fill(1.0);
        if let Some(values) = &record.ss {
            for c in 0..record.ss_channels() {
                for i in 0..n {
                    let src = c * record.length * record.length + i * record.length;
                    let dst = ((b * ss_channels + c) * l + i) * l;
                    ss[dst..dst + n].copy_from_slice(&values[src..src + n]);
                }
            }
        }
    }

    ProteinBatch {
        coords_6d: Tensor::from_data(TensorData::new(coords, [batch, num_channels, l, l]), device),
        mask: Tensor::from_data(TensorData::new(mask, [batch, l]), device),
        ss: (ss_channels > 0)
            .then(|| Tensor::from_data(TensorData::new(ss, [batch, ss_channels, l, l]), device)),
        inpaint: None,
        lengths: records.iter().map(|r| r.length.min(l)).collect(),
    }
}

/// Anything that can hand the training loop a batch for a given step.
pub trait BatchSource<B: Backend> {
    fn next_batch(&mut self, step: usize, device: &B::Device) -> Result<ProteinBatch<B>, SgmError>;
}

/// Draws `batch_size` records with replacement, seeded by `(seed, step)`.
pub struct ReplacementSampler {
    dataset: ProteinDataset,
    batch_size: usize,
    max_res_num: usize,
    seed: u64,
    stream: RngStream,
}

impl ReplacementSampler {
    pub fn new(
        dataset: ProteinDataset,
        batch_size: usize,
        max_res_num: usize,
        seed: u64,
        stream: RngStream,
    ) -> Self {
        Self {
            dataset,
            batch_size,
            max_res_num,
            seed,
            stream,
        }
    }

    /// Record indices used at `step`.
    pub fn indices(&self, step: usize) -> Vec<usize> {
        let mut rng = step_rng(self.seed, step, self.stream);
        let n = self.dataset.len();
        (0..self.batch_size).map(|_| rng.gen_range(0..n)).collect()
    }
}

/// Split `dataset` and serve each half from its own random stream.
pub fn train_eval_samplers(
    dataset: ProteinDataset,
    config: &DataConfig,
    batch_size: usize,
    seed: u64,
) -> Result<(ReplacementSampler, ReplacementSampler), SgmError> {
    let (train, test) = dataset.split(config.train_fraction, seed)?;
    tracing::info!(train = train.len(), test = test.len(), "Dataset split");
    Ok((
        ReplacementSampler::new(train, batch_size, config.max_res_num, seed, RngStream::TrainBatch),
        ReplacementSampler::new(test, batch_size, config.max_res_num, seed, RngStream::EvalBatch),
    ))
}

impl<B: Backend> BatchSource<B> for ReplacementSampler {
    fn next_batch(&mut self, step: usize, device: &B::Device) -> Result<ProteinBatch<B>, SgmError> {
        if self.dataset.is_empty() {
            return Err(SgmError::EmptyDataset("sampler has no records".to_string()));
        }
        let records: Vec<&ProteinRecord> = self
            .indices(step)
            .into_iter()
            .map(|i| &self.dataset.records[i])
            .collect();
        Ok(collate(
            &records,
            self.dataset.num_channels,
            self.max_res_num,
            device,
        ))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    /// Protein of `length` residues whose channel `c` is filled with `c + 1`.
    pub(crate) fn make_record(id: &str, length: usize, channels: usize) -> ProteinRecord {
        let plane = length * length;
        ProteinRecord {
            id: id.to_string(),
            length,
            coords_6d: (0..channels * plane).map(|i| (i / plane + 1) as f32).collect(),
            ss: None,
        }
    }

    #[test]
    fn test_load_jsonl_filters_lengths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proteins.jsonl");
        let lines: Vec<String> = [("a", 3), ("b", 5), ("c", 9)]
            .iter()
            .map(|(id, n)| serde_json::to_string(&make_record(id, *n, 2)).unwrap())
            .collect();
        std::fs::write(&path, lines.join("\n") + "\n\n").unwrap();

        let config = DataConfig::new()
            .with_num_channels(2)
            .with_min_res_num(4)
            .with_max_res_num(8);
        let dataset = ProteinDataset::load_jsonl(&path, &config).unwrap();
        assert_eq!(dataset.len(), 1);
        assert_eq!(dataset.records()[0].id, "b");
    }

    #[test]
    fn test_load_jsonl_rejects_bad_shapes_and_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.jsonl");
        let mut record = make_record("x", 4, 2);
        record.coords_6d.pop();
        std::fs::write(&path, serde_json::to_string(&record).unwrap()).unwrap();
        let config = DataConfig::new().with_num_channels(2).with_min_res_num(1);
        assert!(matches!(
            ProteinDataset::load_jsonl(&path, &config),
            Err(SgmError::InvalidConfig(_))
        ));

        let empty = dir.path().join("empty.jsonl");
        std::fs::write(&empty, "").unwrap();
        assert!(matches!(
            ProteinDataset::load_jsonl(&empty, &config),
            Err(SgmError::EmptyDataset(_))
        ));
    }

    #[test]
    fn test_split_is_seeded_and_disjoint() {
        let records: Vec<_> = (0..40).map(|i| make_record(&i.to_string(), 2, 1)).collect();
        let dataset = ProteinDataset::new(records, 1);

        let (train_a, test_a) = dataset.clone().split(0.95, 7).unwrap();
        let (train_b, test_b) = dataset.split(0.95, 7).unwrap();
        assert_eq!(train_a.len(), 38);
        assert_eq!(test_a.len(), 2);

        let ids = |d: &ProteinDataset| d.records().iter().map(|r| r.id.clone()).collect::<Vec<_>>();
        assert_eq!(ids(&train_a), ids(&train_b));
        assert_eq!(ids(&test_a), ids(&test_b));
        assert!(ids(&test_a).iter().all(|id| !ids(&train_a).contains(id)));
    }

    #[test]
    fn test_small_split_keeps_one_test_example() {
        let records: Vec<_> = (0..3).map(|i| make_record(&i.to_string(), 2, 1)).collect();
        let (train, test) = ProteinDataset::new(records, 1).split(0.95, 0).unwrap();
        assert_eq!((train.len(), test.len()), (2, 1));
        assert!(ProteinDataset::new(vec![make_record("a", 2, 1)], 1)
            .split(0.95, 0)
            .is_err());
    }

    #[test]
    fn test_collate_pads_and_masks() {
        let device = Default::default();
        let short = make_record("short", 2, 2);
        let long = make_record("long", 3, 2);
        let batch = collate::<TestBackend>(&[&short, &long], 2, 4, &device);

        assert_eq!(batch.coords_6d.dims(), [2, 2, 4, 4]);
        assert_eq!(batch.lengths, vec![2, 3]);
        batch.validate().unwrap();

        let mask: Vec<f32> = batch.mask.clone().into_data().to_vec().unwrap();
        assert_eq!(mask, vec![1.0, 1.0, 0.0, 0.0, 1.0, 1.0, 1.0, 0.0]);

        let coords: Vec<f32> = batch.coords_6d.clone().into_data().to_vec().unwrap();
        // Sample 0, channel 1, row 0: two real values then padding.
        assert_eq!(&coords[16..20], &[2.0, 2.0, 0.0, 0.0]);

        let pair: f32 = batch.pair_mask().sum().into_scalar();
        assert_eq!(pair, 4.0 + 9.0);
    }

    #[test]
    fn test_validate_reports_mask_shape() {
        let device = Default::default();
        let record = make_record("a", 2, 1);
        let mut batch = collate::<TestBackend>(&[&record], 1, 4, &device);
        batch.mask = Tensor::ones([1, 3], &device);
        match batch.validate() {
            Err(SgmError::MaskShape { mask, data }) => {
                assert_eq!(mask, vec![1, 3]);
                assert_eq!(data, vec![1, 1, 4, 4]);
            }
            other => panic!("expected MaskShape, got {other:?}"),
        }
    }

    #[test]
    fn test_sampler_is_deterministic_per_step() {
        let records: Vec<_> = (0..10).map(|i| make_record(&i.to_string(), 2, 1)).collect();
        let sampler = ReplacementSampler::new(
            ProteinDataset::new(records, 1),
            4,
            2,
            42,
            RngStream::TrainBatch,
        );
        assert_eq!(sampler.indices(3), sampler.indices(3));
        assert_ne!(sampler.indices(3), sampler.indices(4));
        assert!(sampler.indices(0).iter().all(|&i| i < 10));
    }
}
