use std::path::PathBuf;

use clap::{Parser, Subcommand};

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("GIT_SHA"),
    ", ",
    env!("BUILD_DATE"),
    ")"
);

#[derive(Parser, Debug)]
#[command(name = "stream-play", version = VERSION)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,

    /// Load stream settings from a TOML file (flags override it)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Frames pulled from the stream source per chunk
    #[arg(long)]
    pub chunk_frames: Option<usize>,

    /// Live mode queue buffer target in seconds
    #[arg(long)]
    pub buffer_seconds: Option<f32>,

    /// Reject seeks past the end instead of clamping them
    #[arg(long)]
    pub no_clamp_seek: bool,

    /// Use the soft limiter when converting float samples to 16-bit
    #[arg(long)]
    pub soft_limit: bool,

    /// Output device: `#N` from the `devices` listing, or a name substring
    #[arg(long)]
    pub device: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List output devices and exit
    Devices,

    /// Play an audio file on an output device
    Play {
        /// Path to audio file
        path: PathBuf,

        /// Start position in milliseconds
        #[arg(long)]
        seek_ms: Option<u64>,

        /// Decode on a background thread and stream through a live (non-seekable) queue
        #[arg(long)]
        live: bool,

        /// Files to play after this one, in order (same channel count and rate)
        #[arg(long)]
        then: Vec<PathBuf>,
    },

    /// Pull the whole stream and write it to a 16-bit WAV file
    Render {
        /// Path to audio file
        path: PathBuf,

        /// Output WAV path
        out: PathBuf,

        /// Start position in milliseconds
        #[arg(long)]
        seek_ms: Option<u64>,

        /// Output channel count (defaults to the source layout)
        #[arg(long)]
        channels: Option<u16>,

        /// Files to append after this one, in order (same rate)
        #[arg(long)]
        then: Vec<PathBuf>,
    },
}
