pub mod cifar_data_loader;
pub mod cifar_download;
pub mod cifar_io;
pub mod image_transforms;

pub use cifar_data_loader::CifarLoader;
pub use cifar_download::download_if_absent;
pub use cifar_io::{CifarDataset, CifarKind};
