use crate::{
    error::{CaptionError, Result},
    transform::{Preprocess, load_rgb},
    vocabulary::{PAD, Translation, Vocabulary, tokenize},
};
use burn::{
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    prelude::*,
};
use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};
use serde::Deserialize;
use std::{
    fs::File,
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{debug, info};

pub const CORPUS_FILE: &str = "results.csv";
pub const IMAGE_DIR: &str = "images";

/// One row of the corpus file. Extra columns are ignored.
#[derive(Debug, Deserialize)]
struct CorpusRecord {
    image_name: String,
    comment: String,
}

/// An (image, caption) pair with the caption already tokenized.
#[derive(Clone, Debug, PartialEq)]
pub struct CaptionItem {
    pub image_path: PathBuf,
    pub caption: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct CaptionDataset {
    items: Vec<CaptionItem>,
}

impl CaptionDataset {
    /// Reads `<dir>/results.csv`, shuffles the rows and keeps the first
    /// `percentage` percent of them.
    pub fn open(dir: impl AsRef<Path>, percentage: f64, seed: u64) -> Result<Self> {
        let root = dir.as_ref().to_path_buf();
        if !root.exists() {
            return Err(CaptionError::Config(format!(
                "dataset directory {} does not exist",
                root.display()
            )));
        }
        if !root.is_dir() {
            return Err(CaptionError::Config(format!(
                "{} is not a directory",
                root.display()
            )));
        }

        let corpus_path = root.join(CORPUS_FILE);
        if !corpus_path.is_file() {
            return Err(CaptionError::Config(format!(
                "{} has no {CORPUS_FILE}",
                root.display()
            )));
        }
        let file = File::open(&corpus_path).map_err(|e| CaptionError::io(&corpus_path, e))?;
        let mut items = Self::read_corpus(file, &root.join(IMAGE_DIR))?;

        items.shuffle(&mut StdRng::seed_from_u64(seed));
        items.truncate(fraction_len(items.len(), percentage));

        info!(
            path = %corpus_path.display(),
            pairs = items.len(),
            "caption corpus loaded"
        );
        Ok(Self { items })
    }

    fn read_corpus(reader: impl std::io::Read, image_dir: &Path) -> Result<Vec<CaptionItem>> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'|')
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(reader);

        let mut items = Vec::new();
        for record in reader.deserialize::<CorpusRecord>() {
            let record = record?;
            items.push(CaptionItem {
                image_path: image_dir.join(&record.image_name),
                caption: tokenize(&record.comment),
            });
        }
        Ok(items)
    }

    pub fn from_items(items: Vec<CaptionItem>) -> Self {
        Self { items }
    }

    pub fn items(&self) -> &[CaptionItem] {
        &self.items
    }

    /// Splits off the first `percentage` percent of the rows. With
    /// `remove_from_source` those rows leave `self`, so repeated calls give
    /// disjoint subsets.
    pub fn take_fraction(&mut self, percentage: f64, remove_from_source: bool) -> Self {
        let count = fraction_len(self.items.len(), percentage);
        let items = if remove_from_source {
            self.items.drain(..count).collect()
        } else {
            self.items[..count].to_vec()
        };
        debug!(
            taken = count,
            remaining = self.items.len(),
            "dataset fraction taken"
        );
        Self { items }
    }

    /// Every tokenized word of every caption, in corpus order.
    pub fn words(&self) -> impl Iterator<Item = &str> {
        self.items
            .iter()
            .flat_map(|item| item.caption.iter().map(String::as_str))
    }

    pub fn build_vocabulary(&self) -> Vocabulary {
        Vocabulary::from_words(self.words())
    }
}

impl Dataset<CaptionItem> for CaptionDataset {
    fn get(&self, index: usize) -> Option<CaptionItem> {
        self.items.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

fn fraction_len(len: usize, percentage: f64) -> usize {
    let fraction = (percentage / 100.0).clamp(0.0, 1.0);
    ((len as f64) * fraction) as usize
}

/// Right-pads every row with `pad` to the longest row. Returns the flat
/// row-major buffer and the row width.
pub fn pad_sequences(sequences: &[Vec<usize>], pad: usize) -> (Vec<usize>, usize) {
    let width = sequences.iter().map(Vec::len).max().unwrap_or(0);
    let mut flat = Vec::with_capacity(sequences.len() * width);
    for sequence in sequences {
        flat.extend_from_slice(sequence);
        flat.extend(std::iter::repeat_n(pad, width - sequence.len()));
    }
    (flat, width)
}

#[derive(Clone, Debug)]
pub struct CaptionBatcher {
    vocabulary: Arc<Vocabulary>,
    preprocess: Preprocess,
}

impl CaptionBatcher {
    pub fn new(vocabulary: Arc<Vocabulary>, preprocess: Preprocess) -> Self {
        Self {
            vocabulary,
            preprocess,
        }
    }

    pub fn training(vocabulary: Arc<Vocabulary>, flip_probability: f64) -> Self {
        Self::new(vocabulary, Preprocess::training(flip_probability))
    }

    pub fn evaluation(vocabulary: Arc<Vocabulary>) -> Self {
        Self::new(vocabulary, Preprocess::evaluation())
    }

    pub fn try_batch<B: Backend>(
        &self,
        mut items: Vec<CaptionItem>,
        device: &B::Device,
    ) -> Result<CaptionBatch<B>> {
        if items.is_empty() {
            return Err(CaptionError::Config("cannot batch zero items".into()));
        }

        // The decoder shrinks its active prefix step by step, so the batch
        // must be ordered by descending caption length.
        items.sort_by(|a, b| b.caption.len().cmp(&a.caption.len()));

        let size = self.preprocess.output_size() as usize;
        let mut rng = rand::rng();
        let mut pixels = Vec::with_capacity(items.len() * 3 * size * size);
        for item in &items {
            let image = load_rgb(&item.image_path)?;
            pixels.extend(self.preprocess.to_tensor_data(&image, &mut rng));
        }

        let lengths: Vec<usize> = items.iter().map(|item| item.caption.len()).collect();
        let ids: Vec<Vec<usize>> = items
            .iter()
            .map(|item| self.vocabulary.translate(&item.caption, Translation::Complete))
            .collect();
        let targets: Vec<Vec<usize>> = ids.iter().map(|seq| seq[1..].to_vec()).collect();

        let batch_size = items.len();
        let (captions, width) = pad_sequences(&ids, PAD);
        let (targets, target_width) = pad_sequences(&targets, PAD);

        let images = Tensor::<B, 1>::from_floats(pixels.as_slice(), device)
            .reshape([batch_size, 3, size, size]);
        let captions = int_tensor::<B>(&captions, device).reshape([batch_size, width]);
        let targets = int_tensor::<B>(&targets, device).reshape([batch_size, target_width]);

        Ok(CaptionBatch {
            images,
            captions,
            targets,
            lengths,
        })
    }
}

fn int_tensor<B: Backend>(values: &[usize], device: &B::Device) -> Tensor<B, 1, Int> {
    let values: Vec<i64> = values.iter().map(|&v| v as i64).collect();
    Tensor::<B, 1, Int>::from_ints(values.as_slice(), device)
}

/// A length-sorted mini-batch.
#[derive(Clone, Debug)]
pub struct CaptionBatch<B: Backend> {
    /// `[N, 3, S, S]`, normalized.
    pub images: Tensor<B, 4>,
    /// `[N, Lmax + 2]`: `<START> words <END>` right-padded with `<PAD>`.
    pub captions: Tensor<B, 2, Int>,
    /// `[N, Lmax + 1]`: the captions without `<START>`.
    pub targets: Tensor<B, 2, Int>,
    /// Word count of each caption, descending.
    pub lengths: Vec<usize>,
}

impl<B: Backend> Batcher<B, CaptionItem, Result<CaptionBatch<B>>> for CaptionBatcher {
    fn batch(&self, items: Vec<CaptionItem>, device: &B::Device) -> Result<CaptionBatch<B>> {
        self.try_batch(items, device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use image::{Rgb, RgbImage};
    use std::fs;

    type TestBackend = NdArray;

    const CORPUS: &str = "image_name| comment_number| comment\n\
                          1.jpg| 0| A cat sat .\n\
                          1.jpg| 1| A cat sat on a mat\n\
                          2.jpg| 0| A dog ran fast\n\
                          3.jpg| 0| Dogs , running\n";

    fn write_dataset(dir: &Path) {
        fs::write(dir.join(CORPUS_FILE), CORPUS).unwrap();
        fs::create_dir(dir.join(IMAGE_DIR)).unwrap();
        for name in ["1.jpg", "2.jpg", "3.jpg"] {
            RgbImage::from_pixel(40, 30, Rgb([10, 200, 30]))
                .save(dir.join(IMAGE_DIR).join(name))
                .unwrap();
        }
    }

    #[test]
    fn pads_rows_to_longest() {
        let (flat, width) = pad_sequences(&[vec![7, 8, 9], vec![1, 2, 3, 4, 5]], PAD);
        assert_eq!(width, 5);
        assert_eq!(flat.len(), 10);
        assert_eq!(&flat[..5], &[7, 8, 9, 0, 0]);
        assert_eq!(&flat[5..], &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn open_rejects_missing_directory() {
        let err = CaptionDataset::open("/no/such/dataset", 100.0, 0).unwrap_err();
        assert!(matches!(err, CaptionError::Config(_)));
    }

    #[test]
    fn open_rejects_plain_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let err = CaptionDataset::open(file.path(), 100.0, 0).unwrap_err();
        assert!(matches!(err, CaptionError::Config(_)));
    }

    #[test]
    fn open_rejects_directory_without_corpus() {
        let dir = tempfile::tempdir().unwrap();
        let err = CaptionDataset::open(dir.path(), 100.0, 0).unwrap_err();
        assert!(matches!(err, CaptionError::Config(_)));
    }

    #[test]
    fn open_reads_pipe_delimited_corpus() {
        let dir = tempfile::tempdir().unwrap();
        write_dataset(dir.path());
        let dataset = CaptionDataset::open(dir.path(), 100.0, 42).unwrap();
        assert_eq!(dataset.len(), 4);
        assert!(dataset
            .items()
            .iter()
            .any(|item| item.caption == vec!["dogs", ",", "running"]));
        assert!(dataset
            .items()
            .iter()
            .all(|item| item.image_path.starts_with(dir.path().join(IMAGE_DIR))));

        let half = CaptionDataset::open(dir.path(), 50.0, 42).unwrap();
        assert_eq!(half.len(), 2);
    }

    #[test]
    fn take_fraction_with_removal_gives_disjoint_splits() {
        let items: Vec<CaptionItem> = (0..10)
            .map(|i| CaptionItem {
                image_path: PathBuf::from(format!("{i}.jpg")),
                caption: vec![format!("w{i}")],
            })
            .collect();
        let mut source = CaptionDataset::from_items(items);

        let train = source.take_fraction(50.0, true);
        let eval = source.take_fraction(40.0, true);
        assert_eq!(train.len(), 5);
        assert_eq!(eval.len(), 2);
        assert_eq!(source.len(), 3);
        assert!(train.items().iter().all(|item| !eval.items().contains(item)));

        let copy = source.take_fraction(100.0, false);
        assert_eq!(copy.len(), 3);
        assert_eq!(source.len(), 3);
    }

    #[test]
    fn batch_is_sorted_and_padded() {
        let dir = tempfile::tempdir().unwrap();
        write_dataset(dir.path());
        let dataset = CaptionDataset::open(dir.path(), 100.0, 1).unwrap();
        let vocabulary = Arc::new(dataset.build_vocabulary());
        let batcher = CaptionBatcher::evaluation(vocabulary.clone());

        let device = Default::default();
        let batch: CaptionBatch<TestBackend> =
            batcher.try_batch(dataset.items().to_vec(), &device).unwrap();

        assert_eq!(batch.lengths, vec![6, 4, 4, 3]);
        assert_eq!(batch.images.dims(), [4, 3, 224, 224]);
        assert_eq!(batch.captions.dims(), [4, 8]);
        assert_eq!(batch.targets.dims(), [4, 7]);

        let captions: Vec<i64> = batch.captions.into_data().iter::<i64>().collect();
        assert_eq!(captions[0], 1);
        // Shortest caption: <START> w w w <END> then three <PAD>.
        let last = &captions[24..32];
        assert_eq!(last[4], 2);
        assert_eq!(&last[5..], &[0, 0, 0]);

        let targets: Vec<i64> = batch.targets.into_data().iter::<i64>().collect();
        assert_eq!(&targets[..6], &captions[1..7]);
    }

    #[test]
    fn unreadable_image_fails_the_batch() {
        let vocabulary = Arc::new(Vocabulary::build(["a cat"]));
        let batcher = CaptionBatcher::training(vocabulary, 0.0);
        let items = vec![CaptionItem {
            image_path: PathBuf::from("/missing/image.jpg"),
            caption: vec!["a".into(), "cat".into()],
        }];
        let device = Default::default();
        let result: Result<CaptionBatch<TestBackend>> = batcher.try_batch(items, &device);
        assert!(matches!(result, Err(CaptionError::Io { .. })));
    }
}
