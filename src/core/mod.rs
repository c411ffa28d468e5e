pub mod ffmpeg;
pub mod filename;
pub mod process;
pub mod queue;
pub mod url_parser;
pub mod worker;
pub mod ytdlp;

#[cfg(test)]
mod testing;
