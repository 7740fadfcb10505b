use crate::cifar_io::CifarKind;

use flate2::read::GzDecoder;
use log::info;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

pub const CIFAR_BASE_URL: &str = "https://www.cs.toronto.edu/~kriz";

impl CifarKind {
    /// Name of the gzipped tar of the binary release
    pub fn archive_file(&self) -> &'static str {
        match self {
            Self::Cifar10 => "cifar-10-binary.tar.gz",
            Self::Cifar100 => "cifar-100-binary.tar.gz",
        }
    }

    pub fn archive_url(&self) -> String {
        format!("{}/{}", CIFAR_BASE_URL, self.archive_file())
    }
}

/// Fetch and extract the binary release under `data_dir` unless both
/// splits are already there. An archive left by an earlier run is
/// extracted without downloading it again.
pub fn download_if_absent(data_dir: &Path, kind: CifarKind) -> anyhow::Result<()> {
    if kind.is_available(data_dir) {
        return Ok(());
    }

    std::fs::create_dir_all(data_dir)?;
    let archive = data_dir.join(kind.archive_file());

    if archive.exists() {
        info!("{} already exists, skipping download", archive.display());
    } else {
        download(&kind.archive_url(), &archive)?;
    }

    extract_archive(&archive, data_dir)?;

    if !kind.is_available(data_dir) {
        return Err(anyhow::anyhow!(
            "{} did not contain the {:?} batch files",
            archive.display(),
            kind
        ));
    }
    Ok(())
}

/// Stream `url` into `dest` through a `.part` file
pub fn download(url: &str, dest: &Path) -> anyhow::Result<()> {
    info!("downloading {} to {}", url, dest.display());

    let mut response = reqwest::blocking::get(url)
        .map_err(|e| anyhow::anyhow!("failed to fetch {}: {}", url, e))?;
    if !response.status().is_success() {
        return Err(anyhow::anyhow!(
            "failed to fetch {}: HTTP {}",
            url,
            response.status()
        ));
    }

    let partial = partial_path(dest);
    let mut writer = BufWriter::new(File::create(&partial)?);
    let nbytes = response.copy_to(&mut writer)?;
    writer.flush()?;
    drop(writer);

    std::fs::rename(&partial, dest)?;
    info!("downloaded {} bytes", nbytes);
    Ok(())
}

/// Unpack a `.tar.gz` file into `dest`
pub fn extract_archive(archive: &Path, dest: &Path) -> anyhow::Result<()> {
    info!("extracting {} to {}", archive.display(), dest.display());
    let file = File::open(archive)
        .map_err(|e| anyhow::anyhow!("failed to open {}: {}", archive.display(), e))?;
    let mut tarball = tar::Archive::new(GzDecoder::new(BufReader::new(file)));
    tarball
        .unpack(dest)
        .map_err(|e| anyhow::anyhow!("failed to extract {}: {}", archive.display(), e))?;
    Ok(())
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}
