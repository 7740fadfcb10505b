use log::{info, warn};
use std::path::{Path, PathBuf};

pub const CIFAR_SIDE: usize = 32;
pub const CIFAR_PIXELS: usize = 3 * CIFAR_SIDE * CIFAR_SIDE;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CifarKind {
    Cifar10,
    Cifar100,
}

impl CifarKind {
    /// Unknown names fall back to CIFAR-10
    pub fn from_name(name: &str) -> Self {
        match name.to_lowercase().as_str() {
            "cifar10" => Self::Cifar10,
            "cifar100" => Self::Cifar100,
            _ => {
                warn!("unknown dataset `{}`; using cifar10", name);
                Self::Cifar10
            }
        }
    }

    pub fn num_classes(&self) -> usize {
        match self {
            Self::Cifar10 => 10,
            Self::Cifar100 => 100,
        }
    }

    /// bytes in front of the pixels of each record
    fn label_bytes(&self) -> usize {
        match self {
            Self::Cifar10 => 1,
            Self::Cifar100 => 2,
        }
    }

    fn archive_dir(&self) -> &'static str {
        match self {
            Self::Cifar10 => "cifar-10-batches-bin",
            Self::Cifar100 => "cifar-100-binary",
        }
    }

    /// Both splits can be read from `data_dir`
    pub fn is_available(&self, data_dir: &Path) -> bool {
        let dir = resolve_archive_dir(data_dir, *self);
        [true, false]
            .iter()
            .flat_map(|&train| self.split_files(train))
            .all(|file| dir.join(file).is_file())
    }

    fn split_files(&self, train: bool) -> Vec<String> {
        match (self, train) {
            (Self::Cifar10, true) => (1..=5).map(|b| format!("data_batch_{}.bin", b)).collect(),
            (Self::Cifar10, false) => vec!["test_batch.bin".to_string()],
            (Self::Cifar100, true) => vec!["train.bin".to_string()],
            (Self::Cifar100, false) => vec!["test.bin".to_string()],
        }
    }
}

/// One 32 x 32 image in channel-major order: 1024 red, 1024 green,
/// then 1024 blue bytes
#[derive(Clone, Debug)]
pub struct CifarRecord {
    pub label: u32,
    pub pixels: Box<[u8]>,
}

pub struct CifarDataset {
    pub kind: CifarKind,
    pub records: Vec<CifarRecord>,
}

impl CifarDataset {
    /// Read the train or test split of the binary CIFAR release
    ///
    /// * `data_dir` - the extracted archive folder or its parent
    /// * `kind` - CIFAR-10 or CIFAR-100 (fine labels)
    /// * `train` - train split if true, test split otherwise
    pub fn read(data_dir: &Path, kind: CifarKind, train: bool) -> anyhow::Result<Self> {
        let dir = resolve_archive_dir(data_dir, kind);
        let mut records = vec![];
        for file in kind.split_files(train) {
            let path = dir.join(&file);
            if !path.exists() {
                return Err(anyhow::anyhow!(
                    "{} not found; download or extract the binary {:?} archive under {}",
                    path.display(),
                    kind,
                    data_dir.display()
                ));
            }
            let bytes = std::fs::read(&path)?;
            records.extend(parse_records(&bytes, kind).map_err(|e| {
                anyhow::anyhow!("{}: {}", path.display(), e)
            })?);
        }
        info!(
            "{:?} {} split: {} images from {}",
            kind,
            if train { "train" } else { "test" },
            records.len(),
            dir.display()
        );
        Ok(Self { kind, records })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn num_classes(&self) -> usize {
        self.kind.num_classes()
    }
}

fn resolve_archive_dir(data_dir: &Path, kind: CifarKind) -> PathBuf {
    let nested = data_dir.join(kind.archive_dir());
    if nested.is_dir() {
        nested
    } else {
        data_dir.to_path_buf()
    }
}

/// Split a binary batch file into records
pub fn parse_records(bytes: &[u8], kind: CifarKind) -> anyhow::Result<Vec<CifarRecord>> {
    let offset = kind.label_bytes();
    let record_len = offset + CIFAR_PIXELS;

    if bytes.len() % record_len != 0 {
        return Err(anyhow::anyhow!(
            "truncated file: {} bytes is not a multiple of the {}-byte record",
            bytes.len(),
            record_len
        ));
    }

    let num_classes = kind.num_classes() as u32;

    bytes
        .chunks_exact(record_len)
        .map(|rec| {
            // CIFAR-100 keeps the coarse label first, then the fine label
            let label = rec[offset - 1] as u32;
            if label >= num_classes {
                return Err(anyhow::anyhow!(
                    "label {} out of range for {:?}",
                    label,
                    kind
                ));
            }
            Ok(CifarRecord {
                label,
                pixels: rec[offset..].into(),
            })
        })
        .collect()
}
