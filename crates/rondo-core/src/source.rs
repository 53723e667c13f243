//! Decode source
//!
//! Streams raw signed 16-bit PCM from an ffmpeg child process. Seeking and
//! playback speed are expressed as spawn arguments, so every seek or speed
//! change opens a fresh source rather than mutating a running one.

use std::path::PathBuf;
use std::process::{ Child, ChildStdout, Command, Stdio };
use std::sync::{ Arc, Mutex };

use std::io::Read;

use thiserror::Error;

use crate::probe::TrackFormat;


#[derive( Debug, Error )]
pub enum SourceError {
    #[error( "failed to launch ffmpeg: {0}" )]
    Spawn( #[from] std::io::Error ),

    #[error( "ffmpeg stdout was not captured" )]
    MissingStdout,
}


/// Whether a fully-read source actually delivered the whole track.
#[derive( Debug, Clone, PartialEq )]
pub enum SourceEnd {
    Completed,
    Failed( String ),
}


/// A stream of interleaved s16le PCM at a fixed format.
pub trait PcmSource: Send {
    /// Reads up to `buf.len()` bytes of PCM. `Ok( 0 )` means the stream is
    /// finished and no further data will arrive.
    fn read( &mut self, buf: &mut [u8] ) -> std::io::Result<usize>;

    /// Called once after end of stream: reaps the decoder and reports
    /// whether it finished cleanly or died mid-track.
    fn finish( &mut self ) -> SourceEnd {
        SourceEnd::Completed
    }

    /// Tears the source down. Safe to call more than once and after the
    /// stream has already ended.
    fn stop( &mut self );

    /// A handle that can abort this source from another thread, used to
    /// unblock a reader that is stuck on a stalled stream.
    fn kill_handle( &self ) -> SourceKill {
        SourceKill::none()
    }
}


/// Opens decode sources for one track.
pub trait SourceFactory: Send {
    fn open( &self, offset_secs: f64, speed: f64 ) -> Result<Box<dyn PcmSource>, SourceError>;
}


/// Cross-thread abort handle for a decode source.
///
/// Kills the underlying process without reaping it; the owning thread still
/// runs `stop()` to collect the exit status.
#[derive( Clone )]
pub struct SourceKill {
    child: Option<Arc<Mutex<Child>>>,
}


impl SourceKill {
    pub fn none() -> Self {
        Self { child: None }
    }


    pub fn kill( &self ) {
        if let Some( child ) = &self.child {
            let mut child = child.lock().unwrap();
            let _ = child.kill();
        }
    }
}


/// Builds the atempo filter chain for a playback speed.
///
/// ffmpeg's atempo only accepts factors in [0.5, 2.0], so speeds outside
/// that range are factored into a chain of in-range stages.
fn atempo_chain( speed: f64 ) -> Option<String> {
    if ( speed - 1.0 ).abs() < 1e-3 {
        return None;
    }

    let mut factors: Vec<f64> = Vec::new();
    let mut remaining = speed;
    while remaining > 2.0 {
        factors.push( 2.0 );
        remaining /= 2.0;
    }
    while remaining < 0.5 {
        factors.push( 0.5 );
        remaining *= 2.0;
    }
    factors.push( remaining );

    let chain = factors
        .iter()
        .map( |f| format!( "atempo={}", f ) )
        .collect::<Vec<_>>()
        .join( "," );
    Some( chain )
}


/// Builds the full ffmpeg argument list for one decode session.
fn ffmpeg_args( input: &str, format: &TrackFormat, offset_secs: f64, speed: f64 ) -> Vec<String> {
    let mut args: Vec<String> = vec![ "-v".into(), "error".into() ];

    // Input-side seek: coarse but fast, and always frame-exact enough for
    // a position cursor that restarts from the requested offset.
    if offset_secs > 0.0 {
        args.push( "-ss".into() );
        args.push( format!( "{:.3}", offset_secs ) );
    }

    args.push( "-i".into() );
    args.push( input.into() );

    if let Some( chain ) = atempo_chain( speed ) {
        args.push( "-filter:a".into() );
        args.push( chain );
    }

    args.push( "-ac".into() );
    args.push( format.channels.to_string() );
    args.push( "-ar".into() );
    args.push( format.sample_rate.to_string() );
    args.push( "-acodec".into() );
    args.push( "pcm_s16le".into() );
    args.push( "-f".into() );
    args.push( "s16le".into() );
    args.push( "-".into() );
    args
}


/// PCM stream backed by an ffmpeg child process.
pub struct FfmpegSource {
    child: Arc<Mutex<Child>>,
    stdout: ChildStdout,
    stopped: bool,
}


impl PcmSource for FfmpegSource {
    fn read( &mut self, buf: &mut [u8] ) -> std::io::Result<usize> {
        self.stdout.read( buf )
    }


    fn finish( &mut self ) -> SourceEnd {
        self.stopped = true;

        let mut child = self.child.lock().unwrap();
        match child.wait() {
            Ok( status ) if status.success() => SourceEnd::Completed,
            Ok( status ) => SourceEnd::Failed( format!( "ffmpeg exited with {}", status ) ),
            Err( e ) => SourceEnd::Failed( format!( "Failed to reap ffmpeg: {}", e ) ),
        }
    }


    fn stop( &mut self ) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        let mut child = self.child.lock().unwrap();
        let _ = child.kill();
        let _ = child.wait();
        tracing::debug!( "ffmpeg source stopped" );
    }


    fn kill_handle( &self ) -> SourceKill {
        SourceKill { child: Some( Arc::clone( &self.child ) ) }
    }
}


impl Drop for FfmpegSource {
    fn drop( &mut self ) {
        self.stop();
    }
}


/// Opens ffmpeg decode sessions for a single input file or URL.
pub struct FfmpegFactory {
    input: PathBuf,
    format: TrackFormat,
}


impl FfmpegFactory {
    pub fn new( input: PathBuf, format: TrackFormat ) -> Self {
        Self { input, format }
    }
}


impl SourceFactory for FfmpegFactory {
    fn open( &self, offset_secs: f64, speed: f64 ) -> Result<Box<dyn PcmSource>, SourceError> {
        let input = self.input.display().to_string();
        let args = ffmpeg_args( &input, &self.format, offset_secs, speed );

        tracing::info!(
            "Launching ffmpeg for {:?} (offset {:.3}s, speed {:.2}x)",
            self.input,
            offset_secs,
            speed
        );

        let mut child = Command::new( "ffmpeg" )
            .args( &args )
            .stdin( Stdio::null() )
            .stdout( Stdio::piped() )
            .stderr( Stdio::null() )
            .spawn()?;

        let stdout = child.stdout.take().ok_or( SourceError::MissingStdout )?;

        Ok( Box::new( FfmpegSource {
            child: Arc::new( Mutex::new( child ) ),
            stdout,
            stopped: false,
        }))
    }
}


#[cfg( test )]
mod tests {
    use super::*;


    #[test]
    fn test_atempo_unity_speed_has_no_filter() {
        assert_eq!( atempo_chain( 1.0 ), None );
        assert_eq!( atempo_chain( 1.0004 ), None );
    }


    #[test]
    fn test_atempo_in_range_is_single_stage() {
        assert_eq!( atempo_chain( 1.5 ), Some( "atempo=1.5".to_string() ) );
        assert_eq!( atempo_chain( 0.5 ), Some( "atempo=0.5".to_string() ) );
        assert_eq!( atempo_chain( 2.0 ), Some( "atempo=2".to_string() ) );
    }


    #[test]
    fn test_atempo_slow_speeds_factor_into_chain() {
        assert_eq!( atempo_chain( 0.25 ), Some( "atempo=0.5,atempo=0.5".to_string() ) );
    }


    #[test]
    fn test_atempo_fast_speeds_factor_into_chain() {
        assert_eq!( atempo_chain( 3.0 ), Some( "atempo=2,atempo=1.5".to_string() ) );
    }


    #[test]
    fn test_atempo_factors_stay_in_range() {
        for speed in [ 0.25, 0.3, 0.5, 0.75, 1.2, 1.99, 2.5, 3.0 ] {
            let Some( chain ) = atempo_chain( speed ) else { continue };
            for stage in chain.split( ',' ) {
                let factor: f64 = stage.trim_start_matches( "atempo=" ).parse().unwrap();
                assert!( ( 0.5..=2.0 ).contains( &factor ), "stage {} for speed {}", stage, speed );
            }
        }
    }


    #[test]
    fn test_ffmpeg_args_basic() {
        let format = TrackFormat { sample_rate: 44100, channels: 2, duration: None };
        let args = ffmpeg_args( "song.mp3", &format, 0.0, 1.0 );

        assert!( !args.contains( &"-ss".to_string() ) );
        assert!( !args.contains( &"-filter:a".to_string() ) );
        assert!( args.contains( &"pcm_s16le".to_string() ) );
        assert!( args.contains( &"44100".to_string() ) );
        assert_eq!( args.last().unwrap(), "-" );
    }


    #[test]
    fn test_ffmpeg_args_with_offset_and_speed() {
        let format = TrackFormat { sample_rate: 48000, channels: 1, duration: Some( 60.0 ) };
        let args = ffmpeg_args( "song.flac", &format, 12.5, 2.0 );

        let ss = args.iter().position( |a| a == "-ss" ).unwrap();
        assert_eq!( args[ ss + 1 ], "12.500" );

        // Seek must come before the input for input-side seeking
        let input = args.iter().position( |a| a == "song.flac" ).unwrap();
        assert!( ss < input );

        let filter = args.iter().position( |a| a == "-filter:a" ).unwrap();
        assert_eq!( args[ filter + 1 ], "atempo=2" );
    }
}
