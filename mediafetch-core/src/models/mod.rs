pub mod media;
pub mod record;
pub mod settings;
