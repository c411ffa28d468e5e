use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use mediafetch_core::core::events::{EventBus, QueueEvent};
use mediafetch_core::fs_paths::{AppPaths, DesktopPaths, FixedPaths};
use mediafetch_core::models::record::{DownloadRecord, DownloadStatus, FormatType};
use mediafetch_lib::core::ffmpeg::{self, FfmpegTagger};
use mediafetch_lib::core::ytdlp;
use mediafetch_lib::platforms::generic_ytdlp::GenericYtdlpDownloader;
use mediafetch_lib::platforms::traits::MediaExtractor;
use mediafetch_lib::storage::config;
use mediafetch_lib::storage::history::HistoryFormat;
use mediafetch_lib::storage::store;
use mediafetch_lib::{logging, Collaborators, QueueConfig, QueueManager};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

/// Media download queue with persistent history
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Debug logging unless RUST_LOG is set.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Keep the database and settings here instead of the user data dir.
    #[arg(long, global = true, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Queue a single URL.
    Add {
        url: String,
        /// video or audio.
        #[arg(short, long, default_value = "video", value_parser = parse_format)]
        format: FormatType,
        /// e.g. 1080p or 192kbps. Empty uses the configured default.
        #[arg(short, long, default_value = "")]
        quality: String,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Queue every entry of a playlist.
    Playlist {
        url: String,
        #[arg(short, long, default_value = "video", value_parser = parse_format)]
        format: FormatType,
        #[arg(short, long, default_value = "")]
        quality: String,
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// First entry, 1-based.
        #[arg(long)]
        start: Option<usize>,
        /// Last entry, inclusive.
        #[arg(long)]
        end: Option<usize>,
    },
    /// Show metadata and formats without downloading.
    Info { url: String },
    /// Work through the queue until it is empty.
    Run,
    /// Re-queue a failed download.
    Retry { id: String },
    /// Cancel a queued or running download.
    Cancel { id: String },
    /// Finished downloads, newest first.
    History {
        #[arg(short, long, default_value_t = 20)]
        limit: u32,
    },
    Stats,
    /// Write history to a JSON or CSV file.
    Export {
        path: PathBuf,
        /// json or csv. Defaults to the file extension.
        #[arg(short, long)]
        format: Option<HistoryFormat>,
    },
    /// Load history from a JSON export.
    Import { path: PathBuf },
    /// Delete finished records older than the given number of days.
    Cleanup { days: u32 },
    /// Change how many downloads run at once.
    SetConcurrency { n: u32 },
}

fn parse_format(s: &str) -> Result<FormatType, String> {
    s.parse()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let paths: Box<dyn AppPaths> = match cli.data_dir.clone() {
        Some(dir) => Box::new(FixedPaths(dir)),
        None => Box::new(DesktopPaths),
    };
    let settings = config::load_settings(&paths.settings_path());
    let queue_config = QueueConfig::from_settings(&settings);

    if let Commands::Info { url } = &cli.command {
        let downloader =
            GenericYtdlpDownloader::new(queue_config.socket_timeout_secs, queue_config.proxy.clone());
        return show_info(&downloader, url).await;
    }

    let bus = EventBus::new();
    let downloader = Arc::new(GenericYtdlpDownloader::new(
        queue_config.socket_timeout_secs,
        queue_config.proxy.clone(),
    ));
    let deps = Collaborators {
        store: store::open_store(&paths.database_path()).await,
        engine: downloader.clone(),
        extractor: downloader,
        tagger: Arc::new(FfmpegTagger::new()),
        emitter: Arc::new(bus.clone()),
    };
    let queue = QueueManager::init(queue_config, deps).await;

    let result = execute(&queue, &bus, paths.as_ref(), cli.command).await;
    queue.shutdown().await;
    result
}

async fn execute(
    queue: &QueueManager,
    bus: &EventBus,
    paths: &dyn AppPaths,
    command: Commands,
) -> anyhow::Result<()> {
    match command {
        Commands::Add {
            url,
            format,
            quality,
            output,
        } => {
            let id = queue.add_download(&url, format, &quality, output).await?;
            println!("queued {}", id);
        }
        Commands::Playlist {
            url,
            format,
            quality,
            output,
            start,
            end,
        } => {
            let ids = queue
                .add_playlist(&url, format, &quality, output, start, end)
                .await?;
            println!("queued {} entries", ids.len());
            for id in ids {
                println!("  {}", id);
            }
        }
        Commands::Info { .. } => {}
        Commands::Run => run(queue, bus).await?,
        Commands::Retry { id } => {
            queue.retry(&id).await?;
            println!("{} queued for retry", id);
        }
        Commands::Cancel { id } => {
            queue.cancel(&id).await?;
            println!("{} cancelled", id);
        }
        Commands::History { limit } => {
            for record in queue.get_history(limit).await? {
                println!("{}", summary(&record));
            }
        }
        Commands::Stats => {
            let stats = queue.get_stats().await;
            println!("total:        {}", stats.total);
            println!("completed:    {}", stats.completed);
            println!("failed:       {}", stats.failed);
            println!("success rate: {:.1}%", stats.success_rate);
            println!("downloaded:   {:.1} MB", stats.total_size_mb);
            println!("active:       {}", stats.active_count);
            println!("queued:       {}", stats.queued_count);
        }
        Commands::Export { path, format } => {
            let format = format.unwrap_or_else(|| HistoryFormat::from_path(&path));
            let n = queue.export_history(&path, format).await?;
            println!("exported {} records to {}", n, path.display());
        }
        Commands::Import { path } => {
            let n = queue.import_history(&path).await?;
            println!("imported {} records", n);
        }
        Commands::Cleanup { days } => {
            let n = queue.cleanup_older_than(days).await?;
            println!("removed {} records", n);
        }
        Commands::SetConcurrency { n } => {
            queue.set_max_concurrent(n).await?;
            config::update_settings(&paths.settings_path(), |s| {
                s.advanced.max_concurrent_downloads = n
            })?;
            println!("max concurrent downloads set to {}", n);
        }
    }
    Ok(())
}

async fn show_info(downloader: &GenericYtdlpDownloader, url: &str) -> anyhow::Result<()> {
    let info = downloader.extract_info(url).await?;
    println!("title:    {}", info.title);
    println!("uploader: {}", info.uploader);
    println!("platform: {}", info.platform);
    if let Some(d) = info.duration_seconds {
        println!("duration: {}:{:02}", d / 60, d % 60);
    }
    for f in &info.available_formats {
        println!("  {:<10} {}", f.quality_label, f.format_id);
    }
    Ok(())
}

/// Ticks the scheduler once a second until nothing is left to do or Ctrl-C.
async fn run(queue: &QueueManager, bus: &EventBus) -> anyhow::Result<()> {
    if ytdlp::find_ytdlp().await.is_none() {
        warn!("yt-dlp not found on PATH, downloads will fail");
    }
    if !ffmpeg::is_ffmpeg_available().await {
        warn!("ffmpeg not found, audio extraction and tagging are unavailable");
    }

    let mut events = bus.subscribe();
    let mut printed: HashMap<String, (DownloadStatus, u8)> = HashMap::new();
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                queue.tick().await;
                if queue.is_idle().await {
                    break;
                }
            }
            event = events.recv() => match event {
                Ok(event) => print_event(&event, &mut printed),
                Err(RecvError::Lagged(n)) => warn!("missed {} queue events", n),
                Err(RecvError::Closed) => break,
            },
            _ = &mut ctrl_c => {
                info!("interrupted, stopping downloads");
                break;
            }
        }
    }

    while let Ok(event) = events.try_recv() {
        print_event(&event, &mut printed);
    }
    Ok(())
}

fn print_event(event: &QueueEvent, printed: &mut HashMap<String, (DownloadStatus, u8)>) {
    let record = event.record();
    let bucket = record.progress_percent / 10;
    let key = (record.status, bucket);
    if printed.get(&record.id) == Some(&key) {
        return;
    }
    printed.insert(record.id.clone(), key);
    println!("{}", summary(record));
}

fn summary(record: &DownloadRecord) -> String {
    let title = if record.title.is_empty() {
        record.url.as_str()
    } else {
        record.title.as_str()
    };
    let mut line = format!(
        "{} {:<11} {:>3}% {}",
        record.id,
        record.status.as_str(),
        record.progress_percent,
        title
    );
    if let Some(err) = &record.error_message {
        if record.status == DownloadStatus::Failed || record.status == DownloadStatus::Cancelled {
            line.push_str(&format!(" ({})", err));
        }
    }
    line
}
