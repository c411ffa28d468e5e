pub mod generic_ytdlp;
pub mod traits;
