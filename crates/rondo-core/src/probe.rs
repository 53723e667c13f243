//! Format probing via ffprobe
//!
//! Runs a one-shot, bounded-time metadata query before playback starts and
//! falls back to safe defaults when the query fails or times out.

use std::io::Read;
use std::path::Path;
use std::process::{ Command, Stdio };
use std::time::{ Duration, Instant };

use serde::Deserialize;


/// Bytes per sample of the engine's wire format (signed 16-bit PCM).
pub const BYTES_PER_SAMPLE: u64 = 2;

/// How long the external probe may run before it is killed.
const PROBE_DEADLINE: Duration = Duration::from_secs( 3 );


/// Fixed audio format of one playback session.
///
/// `duration` is `None` when the container does not report one; readers must
/// treat that as "unknown", not as an empty track.
#[derive( Debug, Clone, Copy, PartialEq )]
pub struct TrackFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub duration: Option<f64>,
}


impl TrackFormat {
    /// Conservative default used whenever probing fails: CD-style stereo
    /// with unknown duration.
    pub fn fallback() -> Self {
        Self {
            sample_rate: 44100,
            channels: 2,
            duration: None,
        }
    }


    /// Bytes of PCM that represent one second of audio in this format.
    pub fn bytes_per_second( &self ) -> u64 {
        self.sample_rate as u64 * self.channels as u64 * BYTES_PER_SAMPLE
    }


    /// Converts a position in seconds to a frame-aligned byte offset.
    pub fn seconds_to_bytes( &self, seconds: f64 ) -> u64 {
        let frames = ( seconds.max( 0.0 ) * self.sample_rate as f64 ).round() as u64;
        frames * self.channels as u64 * BYTES_PER_SAMPLE
    }


    /// Converts a byte count of PCM back to seconds.
    pub fn bytes_to_seconds( &self, bytes: u64 ) -> f64 {
        let bps = self.bytes_per_second();
        if bps == 0 {
            return 0.0;
        }
        bytes as f64 / bps as f64
    }
}


// ffprobe reports numbers as JSON strings ("44100", "185.36", "N/A"), so
// everything is deserialized as optional text and parsed afterwards.
#[derive( Debug, Deserialize )]
struct ProbeReport {
    #[serde( default )]
    streams: Vec<ProbeStream>,
    format: Option<ProbeContainer>,
}


#[derive( Debug, Deserialize )]
struct ProbeStream {
    sample_rate: Option<String>,
    channels: Option<u16>,
}


#[derive( Debug, Deserialize )]
struct ProbeContainer {
    duration: Option<String>,
}


/// Builds the ffprobe invocation for the given file.
fn ffprobe_args( path: &Path ) -> Vec<String> {
    vec![
        "-v".into(),
        "error".into(),
        "-select_streams".into(),
        "a:0".into(),
        "-show_entries".into(),
        "stream=sample_rate,channels:format=duration".into(),
        "-print_format".into(),
        "json".into(),
        path.display().to_string(),
    ]
}


/// Parses ffprobe's JSON report into a track format.
///
/// Returns None when the report carries no usable audio stream, leaving the
/// caller to apply defaults.
fn parse_report( json: &str ) -> Option<TrackFormat> {
    let report: ProbeReport = serde_json::from_str( json ).ok()?;
    let stream = report.streams.first()?;

    let sample_rate: u32 = stream.sample_rate.as_deref()?.parse().ok()?;
    let channels = stream.channels?;
    if sample_rate == 0 || channels == 0 {
        return None;
    }

    // Duration lives on the container and is optional; "N/A" simply fails
    // the parse and stays unknown.
    let duration = report.format
        .and_then( |f| f.duration )
        .and_then( |d| d.parse::<f64>().ok() )
        .filter( |d| d.is_finite() && *d > 0.0 );

    Some( TrackFormat {
        sample_rate,
        channels,
        duration,
    })
}


/// Probes a file for its sample rate, channel count, and duration.
///
/// Never fails: a missing ffprobe binary, a hung query, a nonzero exit, or
/// unparseable output all degrade to `TrackFormat::fallback()` so playback
/// can still be attempted.
pub fn probe_format( path: &Path ) -> TrackFormat {
    let mut child = match Command::new( "ffprobe" )
        .args( ffprobe_args( path ) )
        .stdin( Stdio::null() )
        .stdout( Stdio::piped() )
        .stderr( Stdio::null() )
        .spawn()
    {
        Ok( child ) => child,
        Err( e ) => {
            tracing::warn!( "ffprobe unavailable ({}), using default format", e );
            return TrackFormat::fallback();
        }
    };

    // Poll for exit with a hard deadline; the report is tiny so it is safe
    // to read stdout only after the process has finished.
    let deadline = Instant::now() + PROBE_DEADLINE;
    loop {
        match child.try_wait() {
            Ok( Some( status ) ) => {
                if !status.success() {
                    tracing::warn!( "ffprobe exited with {} for {:?}", status, path );
                    return TrackFormat::fallback();
                }
                break;
            }
            Ok( None ) => {
                if Instant::now() >= deadline {
                    tracing::warn!( "ffprobe timed out probing {:?}", path );
                    let _ = child.kill();
                    let _ = child.wait();
                    return TrackFormat::fallback();
                }
                std::thread::sleep( Duration::from_millis( 20 ) );
            }
            Err( e ) => {
                tracing::warn!( "ffprobe wait failed: {}", e );
                let _ = child.kill();
                let _ = child.wait();
                return TrackFormat::fallback();
            }
        }
    }

    let mut json = String::new();
    if let Some( mut stdout ) = child.stdout.take() {
        let _ = stdout.read_to_string( &mut json );
    }

    match parse_report( &json ) {
        Some( format ) => {
            tracing::info!(
                "Probed {:?}: {} Hz, {} channels, duration: {:?}s",
                path,
                format.sample_rate,
                format.channels,
                format.duration
            );
            format
        }
        None => {
            tracing::warn!( "Unusable ffprobe report for {:?}, using default format", path );
            TrackFormat::fallback()
        }
    }
}


#[cfg( test )]
mod tests {
    use super::*;


    #[test]
    fn test_parse_full_report() {
        let json = r#"{
            "streams": [ { "sample_rate": "48000", "channels": 2 } ],
            "format": { "duration": "185.363265" }
        }"#;
        let format = parse_report( json ).unwrap();
        assert_eq!( format.sample_rate, 48000 );
        assert_eq!( format.channels, 2 );
        assert!( ( format.duration.unwrap() - 185.363265 ).abs() < 1e-9 );
    }


    #[test]
    fn test_parse_missing_duration() {
        let json = r#"{ "streams": [ { "sample_rate": "44100", "channels": 1 } ], "format": {} }"#;
        let format = parse_report( json ).unwrap();
        assert_eq!( format.sample_rate, 44100 );
        assert_eq!( format.channels, 1 );
        assert_eq!( format.duration, None );
    }


    #[test]
    fn test_parse_na_duration_is_unknown() {
        let json = r#"{
            "streams": [ { "sample_rate": "44100", "channels": 2 } ],
            "format": { "duration": "N/A" }
        }"#;
        let format = parse_report( json ).unwrap();
        assert_eq!( format.duration, None );
    }


    #[test]
    fn test_parse_no_audio_stream() {
        let json = r#"{ "streams": [], "format": { "duration": "10.0" } }"#;
        assert!( parse_report( json ).is_none() );
    }


    #[test]
    fn test_parse_garbage() {
        assert!( parse_report( "not json" ).is_none() );
        assert!( parse_report( "" ).is_none() );
    }


    #[test]
    fn test_seconds_to_bytes_frame_aligned() {
        let format = TrackFormat { sample_rate: 44100, channels: 2, duration: Some( 10.0 ) };
        // One second of 16-bit stereo at 44.1 kHz
        assert_eq!( format.seconds_to_bytes( 1.0 ), 176_400 );
        // Always a whole number of 4-byte frames
        assert_eq!( format.seconds_to_bytes( 0.333 ) % 4, 0 );
        assert_eq!( format.seconds_to_bytes( 0.0 ), 0 );
        assert_eq!( format.seconds_to_bytes( -5.0 ), 0 );
    }


    #[test]
    fn test_bytes_to_seconds_round_trip() {
        let format = TrackFormat { sample_rate: 48000, channels: 2, duration: None };
        let bytes = format.seconds_to_bytes( 7.25 );
        assert!( ( format.bytes_to_seconds( bytes ) - 7.25 ).abs() < 1e-6 );
    }


    #[test]
    fn test_ffprobe_args_shape() {
        let args = ffprobe_args( Path::new( "/music/a.flac" ) );
        assert!( args.contains( &"json".to_string() ) );
        assert!( args.contains( &"stream=sample_rate,channels:format=duration".to_string() ) );
        assert_eq!( args.last().unwrap(), "/music/a.flac" );
    }
}
