pub mod vit_config;
pub mod vit_layers;
pub mod vit_model;
pub mod vit_pretrained;

pub use vit_config::ViTConfig;
pub use vit_model::VisionTransformer;
