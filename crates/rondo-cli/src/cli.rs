//! Command-line argument parsing for Rondo.

use std::path::PathBuf;

use clap::Parser;


/// Rondo - A streaming audio player for the terminal.
#[derive( Parser, Debug )]
#[command( name = "rondo" )]
#[command( version, about, long_about = None )]
pub struct Args {
    /// Audio file to play.
    pub input: PathBuf,

    /// Startup volume in percent (0-200).
    #[arg( short, long )]
    pub volume: Option<u16>,

    /// Startup playback speed multiplier (0.25-3.0).
    #[arg( short, long )]
    pub speed: Option<f64>,
}
