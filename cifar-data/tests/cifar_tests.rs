use approx::assert_abs_diff_eq;
use candle_core::Device;
use candle_util::candle_data_loader::{DataLoader, Sampling};
use cifar_data::cifar_io::*;
use cifar_data::image_transforms::*;
use cifar_data::{download_if_absent, CifarLoader};

use std::path::Path;

/// record `i` has label `i % classes` and every pixel set to `i`
fn synthetic_records(kind: CifarKind, n: usize) -> Vec<u8> {
    let mut bytes = vec![];
    for i in 0..n {
        let label = (i % kind.num_classes()) as u8;
        if kind == CifarKind::Cifar100 {
            bytes.push(label / 5); // coarse
        }
        bytes.push(label);
        bytes.extend(std::iter::repeat(i as u8).take(CIFAR_PIXELS));
    }
    bytes
}

fn write_cifar10(dir: &Path, per_batch: usize, test: usize) -> anyhow::Result<()> {
    let archive = dir.join("cifar-10-batches-bin");
    std::fs::create_dir_all(&archive)?;
    for b in 1..=5 {
        std::fs::write(
            archive.join(format!("data_batch_{}.bin", b)),
            synthetic_records(CifarKind::Cifar10, per_batch),
        )?;
    }
    std::fs::write(
        archive.join("test_batch.bin"),
        synthetic_records(CifarKind::Cifar10, test),
    )?;
    Ok(())
}

#[test]
fn read_cifar10_from_parent_dir() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    write_cifar10(dir.path(), 3, 4)?;

    let train = CifarDataset::read(dir.path(), CifarKind::Cifar10, true)?;
    assert_eq!(train.len(), 15);
    assert_eq!(train.num_classes(), 10);
    assert_eq!(train.records[1].label, 1);
    assert_eq!(train.records[1].pixels.len(), CIFAR_PIXELS);

    // pointing at the archive folder itself works too
    let test = CifarDataset::read(&dir.path().join("cifar-10-batches-bin"), CifarKind::Cifar10, false)?;
    assert_eq!(test.len(), 4);
    Ok(())
}

#[test]
fn read_cifar100_uses_fine_labels() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let archive = dir.path().join("cifar-100-binary");
    std::fs::create_dir_all(&archive)?;
    std::fs::write(archive.join("train.bin"), synthetic_records(CifarKind::Cifar100, 60))?;

    let train = CifarDataset::read(dir.path(), CifarKind::Cifar100, true)?;
    assert_eq!(train.len(), 60);
    assert_eq!(train.records[57].label, 57);
    assert_eq!(train.num_classes(), 100);
    Ok(())
}

#[test]
fn truncated_or_missing_files_are_errors() -> anyhow::Result<()> {
    let mut bytes = synthetic_records(CifarKind::Cifar10, 2);
    bytes.pop();
    assert!(parse_records(&bytes, CifarKind::Cifar10).is_err());

    let dir = tempfile::tempdir()?;
    assert!(CifarDataset::read(dir.path(), CifarKind::Cifar10, false).is_err());
    Ok(())
}

#[test]
fn extracted_data_is_not_downloaded_again() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    write_cifar10(dir.path(), 1, 1)?;
    assert!(CifarKind::Cifar10.is_available(dir.path()));
    assert!(!CifarKind::Cifar100.is_available(dir.path()));

    download_if_absent(dir.path(), CifarKind::Cifar10)?;
    assert!(!dir.path().join(CifarKind::Cifar10.archive_file()).exists());
    Ok(())
}

#[test]
fn existing_archive_is_extracted() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let archive = dir.path().join(CifarKind::Cifar100.archive_file());

    let gz = flate2::write::GzEncoder::new(
        std::fs::File::create(&archive)?,
        flate2::Compression::default(),
    );
    let mut builder = tar::Builder::new(gz);
    for (name, n) in [("train.bin", 6), ("test.bin", 2)] {
        let bytes = synthetic_records(CifarKind::Cifar100, n);
        let mut header = tar::Header::new_gnu();
        header.set_size(bytes.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, format!("cifar-100-binary/{}", name), bytes.as_slice())?;
    }
    builder.into_inner()?.finish()?;

    let data_dir = dir.path();
    download_if_absent(data_dir, CifarKind::Cifar100)?;
    assert!(CifarKind::Cifar100.is_available(data_dir));

    let train = CifarDataset::read(data_dir, CifarKind::Cifar100, true)?;
    let test = CifarDataset::read(data_dir, CifarKind::Cifar100, false)?;
    assert_eq!((train.len(), test.len()), (6, 2));
    assert_eq!(
        CifarKind::Cifar10.archive_url(),
        "https://www.cs.toronto.edu/~kriz/cifar-10-binary.tar.gz"
    );
    Ok(())
}

#[test]
fn unknown_dataset_falls_back_to_cifar10() {
    assert_eq!(CifarKind::from_name("cifar100"), CifarKind::Cifar100);
    assert_eq!(CifarKind::from_name("CIFAR10"), CifarKind::Cifar10);
    assert_eq!(CifarKind::from_name("svhn"), CifarKind::Cifar10);
}

#[test]
fn test_transform_resizes_and_normalizes() -> anyhow::Result<()> {
    let pixels = vec![255u8; CIFAR_PIXELS];
    let mut rng = rand::rng();
    let out = Compose::test(48).apply_cifar(&pixels, &mut rng)?;
    assert_eq!((out.height, out.width), (48, 48));
    assert_eq!(out.data.len(), 3 * 48 * 48);
    for v in out.data {
        assert_abs_diff_eq!(v, 1.0, epsilon = 1e-6);
    }

    let zeros = vec![0u8; CIFAR_PIXELS];
    let out = Compose::test(32).apply_cifar(&zeros, &mut rng)?;
    assert!(out.data.iter().all(|&v| (v + 1.0).abs() < 1e-6));
    Ok(())
}

#[test]
fn flip_mirrors_columns() -> anyhow::Result<()> {
    // red channel increases left to right
    let mut pixels = vec![0u8; CIFAR_PIXELS];
    for y in 0..CIFAR_SIDE {
        for x in 0..CIFAR_SIDE {
            pixels[y * CIFAR_SIDE + x] = (x * 8) as u8;
        }
    }
    let mut rng = rand::rng();

    let flip = Compose::new(vec![TransformStep::RandomHorizontalFlip(1.0)], [0.; 3], [1.; 3]);
    let out = flip.apply_cifar(&pixels, &mut rng)?;
    assert_abs_diff_eq!(out.data[0], 248. / 255., epsilon = 1e-6);
    assert_abs_diff_eq!(out.data[31], 0.0, epsilon = 1e-6);

    let keep = Compose::new(vec![TransformStep::RandomHorizontalFlip(0.0)], [0.; 3], [1.; 3]);
    let out = keep.apply_cifar(&pixels, &mut rng)?;
    assert_abs_diff_eq!(out.data[0], 0.0, epsilon = 1e-6);
    Ok(())
}

#[test]
fn oversized_crop_is_an_error() {
    let pixels = vec![0u8; CIFAR_PIXELS];
    let crop = Compose::new(vec![TransformStep::RandomCrop(40)], HALF_MEAN, HALF_STD);
    assert!(crop.apply_cifar(&pixels, &mut rand::rng()).is_err());
}

#[test]
fn loader_serves_batches() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    write_cifar10(dir.path(), 2, 5)?;

    let test = CifarDataset::read(dir.path(), CifarKind::Cifar10, false)?;
    let mut loader = CifarLoader::new(test, Compose::test(16), Sampling::Sequential, 0, 2)?;
    loader.shuffle_minibatch(2)?;
    assert_eq!(loader.num_minibatch(), 3);
    assert_eq!(loader.num_samples(), 5);

    let mb = loader.minibatch_data(2, &Device::Cpu)?;
    assert_eq!(mb.input.dims(), &[1, 3, 16, 16]);
    let labels = mb.output.ok_or(anyhow::anyhow!("labels"))?.to_vec1::<u32>()?;
    assert_eq!(labels, vec![4]);

    assert!(loader.minibatch_data(3, &Device::Cpu).is_err());

    let train = CifarDataset::read(dir.path(), CifarKind::Cifar10, true)?;
    let mut loader = CifarLoader::new(
        train,
        Compose::train(24),
        Sampling::Distributed {
            rank: 1,
            world_size: 4,
        },
        0,
        2,
    )?;
    loader.shuffle_minibatch(2)?;
    // 10 samples padded to 12, 3 per rank
    assert_eq!(loader.num_samples(), 3);
    assert_eq!(loader.num_minibatch(), 2);
    let mb = loader.minibatch_data(0, &Device::Cpu)?;
    assert_eq!(mb.input.dims(), &[2, 3, 24, 24]);
    Ok(())
}

#[test]
fn augmentation_is_reproducible() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    write_cifar10(dir.path(), 4, 1)?;

    let batch = |workers: usize| -> anyhow::Result<Vec<f32>> {
        let train = CifarDataset::read(dir.path(), CifarKind::Cifar10, true)?;
        let mut loader = CifarLoader::new(train, Compose::train(40), Sampling::Random, 7, workers)?;
        loader.shuffle_minibatch(4)?;
        let mb = loader.minibatch_data(0, &Device::Cpu)?;
        Ok(mb.input.flatten_all()?.to_vec1::<f32>()?)
    };

    assert_eq!(batch(1)?, batch(3)?);
    Ok(())
}
