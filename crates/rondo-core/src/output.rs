//! Audio output via cpal
//!
//! Sends decoded PCM to the system audio device through a bounded FIFO. The
//! device callback pulls from the FIFO; the playback loop pushes into it,
//! which is where backpressure against the decoder comes from.

use std::collections::VecDeque;
use std::sync::{ Arc, Mutex };
use std::sync::atomic::{ AtomicBool, Ordering };

use cpal::traits::{ DeviceTrait, HostTrait, StreamTrait };
use thiserror::Error;

use crate::probe::TrackFormat;


/// How much audio the FIFO holds before pushes start bouncing, in seconds.
/// This is the latency ceiling between a volume change and hearing it.
const FIFO_SECONDS: f64 = 0.5;

/// Widest channel layout the FIFO will remap.
const MAX_CHANNELS: usize = 32;


#[derive( Debug, Error )]
pub enum OutputError {
    #[error( "no audio output device available" )]
    NoDevice,

    #[error( "could not query device configs: {0}" )]
    StreamConfig( String ),

    #[error( "could not build output stream: {0}" )]
    BuildStream( String ),

    #[error( "could not start output stream: {0}" )]
    PlayStream( String ),
}


/// Destination for decoded samples, as seen by the playback loop.
///
/// `write` accepts as much as currently fits and returns the count, so the
/// caller owns the retry loop and can keep checking its control flags while
/// the device drains.
pub trait AudioSink: Send {
    /// Pushes samples, returning how many were accepted.
    fn write( &mut self, samples: &[i16] ) -> usize;

    /// While paused the device keeps running but emits silence; buffered
    /// samples are retained for resume.
    fn set_paused( &self, paused: bool );

    /// Drops all buffered samples without playing them.
    fn discard( &self );

    /// Number of samples waiting to be played.
    fn buffered( &self ) -> usize;

    /// First device failure observed by the stream, if any. Once set, the
    /// sink will never accept audio again and the session must end.
    fn error( &self ) -> Option<String> {
        None
    }
}


/// Bounded sample queue between the playback loop and the device callback.
///
/// Stores the session's interleaved i16 samples and hands the device f32
/// frames, remapping channels on the way out when the device could not be
/// opened with the session's layout. Underrun and pause both come out as
/// silence; neither ever blocks the callback.
pub struct PcmFifo {
    queue: Mutex<VecDeque<i16>>,
    capacity: usize,
    held: AtomicBool,
    session_channels: usize,
    device_channels: usize,
}


impl PcmFifo {
    pub fn new( capacity: usize, session_channels: u16, device_channels: u16 ) -> Self {
        Self {
            queue: Mutex::new( VecDeque::with_capacity( capacity ) ),
            capacity,
            held: AtomicBool::new( false ),
            session_channels: ( session_channels.max( 1 ) as usize ).min( MAX_CHANNELS ),
            device_channels: ( device_channels.max( 1 ) as usize ).min( MAX_CHANNELS ),
        }
    }


    /// Queues up to `samples.len()` samples and returns how many fit.
    pub fn push( &self, samples: &[i16] ) -> usize {
        let mut queue = self.queue.lock().unwrap();
        let room = self.capacity.saturating_sub( queue.len() );
        let taken = samples.len().min( room );
        queue.extend( samples[ ..taken ].iter().copied() );
        taken
    }


    /// Fills `out` with f32 device frames, remapping channels as needed, and
    /// returns how many output samples carry audio. The tail past that point
    /// is zeroed, as is everything while held or after underrun.
    pub fn pop( &self, out: &mut [f32] ) -> usize {
        if self.held.load( Ordering::Relaxed ) {
            out.fill( 0.0 );
            return 0;
        }

        let mut queue = self.queue.lock().unwrap();
        let frames = ( out.len() / self.device_channels )
            .min( queue.len() / self.session_channels );

        let mut frame = [ 0.0f32; MAX_CHANNELS ];
        for i in 0..frames {
            for slot in frame[ ..self.session_channels ].iter_mut() {
                *slot = to_f32( queue.pop_front().unwrap() );
            }
            remap_frame(
                &frame[ ..self.session_channels ],
                &mut out[ i * self.device_channels.. ][ ..self.device_channels ],
            );
        }

        let filled = frames * self.device_channels;
        out[ filled.. ].fill( 0.0 );
        filled
    }


    pub fn len( &self ) -> usize {
        self.queue.lock().unwrap().len()
    }


    pub fn is_empty( &self ) -> bool {
        self.queue.lock().unwrap().is_empty()
    }


    pub fn clear( &self ) {
        self.queue.lock().unwrap().clear();
    }


    pub fn set_paused( &self, paused: bool ) {
        self.held.store( paused, Ordering::Relaxed );
    }


    pub fn is_paused( &self ) -> bool {
        self.held.load( Ordering::Relaxed )
    }
}


fn to_f32( sample: i16 ) -> f32 {
    sample as f32 / 32768.0
}


/// Maps one source frame onto one device frame.
///
/// Stereo-to-mono averages; mono (or any narrower layout) repeats its last
/// channel into the extra device channels; a wider source drops its excess
/// channels.
fn remap_frame( src: &[f32], dst: &mut [f32] ) {
    if src.len() == 2 && dst.len() == 1 {
        dst[ 0 ] = ( src[ 0 ] + src[ 1 ] ) * 0.5;
        return;
    }
    for ( ch, slot ) in dst.iter_mut().enumerate() {
        *slot = src[ ch.min( src.len() - 1 ) ];
    }
}


/// Picks a stream config for the session format.
///
/// Tiers: exact rate and channel match; then any channel count at the
/// session rate (the FIFO remaps); then the device default, which plays at
/// the wrong rate and is only better than not playing at all.
fn select_config(
    device: &cpal::Device,
    format: &TrackFormat,
) -> Result<cpal::StreamConfig, OutputError> {
    let rate = cpal::SampleRate( format.sample_rate );
    let supported: Vec<_> = device
        .supported_output_configs()
        .map_err( |e| OutputError::StreamConfig( e.to_string() ) )?
        .filter( |c| c.min_sample_rate() <= rate && c.max_sample_rate() >= rate )
        .collect();

    if let Some( exact ) = supported.iter().find( |c| c.channels() == format.channels ) {
        return Ok( exact.clone().with_sample_rate( rate ).config() );
    }

    if let Some( near ) = supported.first() {
        tracing::info!(
            "Device lacks a {}-channel config at {} Hz, remapping to {} channels",
            format.channels,
            format.sample_rate,
            near.channels()
        );
        return Ok( near.clone().with_sample_rate( rate ).config() );
    }

    let fallback = device
        .default_output_config()
        .map_err( |e| OutputError::StreamConfig( e.to_string() ) )?;
    tracing::warn!(
        "Device does not support {} Hz, falling back to {} Hz; pitch will be off",
        format.sample_rate,
        fallback.sample_rate().0
    );
    Ok( fallback.config() )
}


/// Keeps the cpal stream alive for the lifetime of the sink.
///
/// cpal::Stream is !Send, but the sink is created on the controlling thread
/// and moved once onto the session thread. The stream is never touched after
/// construction; it only has to be dropped where the sink is dropped.
struct StreamHolder( #[allow( dead_code )] cpal::Stream );

// SAFETY: the stream is only dropped by the holder, never used concurrently;
// cpal's callback runs on its own internally-managed thread either way.
unsafe impl Send for StreamHolder {}


/// System audio sink: a running cpal stream fed from a shared FIFO.
pub struct DeviceSink {
    fifo: Arc<PcmFifo>,
    fault: Arc<Mutex<Option<String>>>,
    _stream: StreamHolder,
}


impl DeviceSink {
    /// Opens the default output device for the session format and starts
    /// the stream. Any failure here makes playback impossible and is
    /// propagated.
    pub fn open( format: &TrackFormat ) -> Result<Self, OutputError> {
        let host = cpal::default_host();
        let device = host.default_output_device().ok_or( OutputError::NoDevice )?;
        let config = select_config( &device, format )?;

        tracing::info!(
            "Output open on {:?}: {} Hz, {} channels",
            device.name(),
            config.sample_rate.0,
            config.channels
        );

        let capacity =
            ( format.sample_rate as f64 * format.channels as f64 * FIFO_SECONDS ) as usize;
        let fifo = Arc::new( PcmFifo::new( capacity, format.channels, config.channels ) );

        let fault = Arc::new( Mutex::new( None ) );
        let fault_writer = Arc::clone( &fault );
        let consumer = Arc::clone( &fifo );
        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    consumer.pop( data );
                },
                move |err| {
                    tracing::error!( "Audio stream error: {}", err );
                    fault_writer.lock().unwrap().get_or_insert_with( || err.to_string() );
                },
                None,
            )
            .map_err( |e| OutputError::BuildStream( e.to_string() ) )?;
        stream
            .play()
            .map_err( |e| OutputError::PlayStream( e.to_string() ) )?;

        Ok( Self {
            fifo,
            fault,
            _stream: StreamHolder( stream ),
        })
    }
}


impl AudioSink for DeviceSink {
    fn write( &mut self, samples: &[i16] ) -> usize {
        self.fifo.push( samples )
    }


    fn set_paused( &self, paused: bool ) {
        self.fifo.set_paused( paused );
    }


    fn discard( &self ) {
        self.fifo.clear();
    }


    fn buffered( &self ) -> usize {
        self.fifo.len()
    }


    fn error( &self ) -> Option<String> {
        self.fault.lock().unwrap().clone()
    }
}


#[cfg( test )]
mod tests {
    use super::*;


    #[test]
    fn test_push_respects_capacity() {
        let fifo = PcmFifo::new( 4, 2, 2 );
        assert_eq!( fifo.push( &[ 1, 2, 3 ] ), 3 );
        assert_eq!( fifo.push( &[ 4, 5, 6 ] ), 1 );
        assert_eq!( fifo.len(), 4 );
        assert_eq!( fifo.push( &[ 7 ] ), 0 );
    }


    #[test]
    fn test_pop_converts_to_f32() {
        let fifo = PcmFifo::new( 16, 2, 2 );
        fifo.push( &[ 16384, -32768, 0, 32767 ] );

        let mut out = [ 9.0f32; 4 ];
        assert_eq!( fifo.pop( &mut out ), 4 );
        assert!( ( out[ 0 ] - 0.5 ).abs() < 1e-6 );
        assert!( ( out[ 1 ] + 1.0 ).abs() < 1e-6 );
        assert_eq!( out[ 2 ], 0.0 );
        assert!( out[ 3 ] < 1.0 && out[ 3 ] > 0.999 );
    }


    #[test]
    fn test_pop_fills_shortfall_with_silence() {
        let fifo = PcmFifo::new( 16, 2, 2 );
        fifo.push( &[ 16384, 16384 ] );

        let mut out = [ 9.0f32; 6 ];
        assert_eq!( fifo.pop( &mut out ), 2 );
        assert_eq!( &out[ 2.. ], &[ 0.0, 0.0, 0.0, 0.0 ] );
    }


    #[test]
    fn test_paused_pop_emits_silence_and_retains() {
        let fifo = PcmFifo::new( 16, 2, 2 );
        fifo.push( &[ 100, 200, 300, 400 ] );
        fifo.set_paused( true );

        let mut out = [ 9.0f32; 4 ];
        assert_eq!( fifo.pop( &mut out ), 0 );
        assert!( out.iter().all( |s| *s == 0.0 ) );
        assert_eq!( fifo.len(), 4 );

        // Resume picks up exactly where it left off
        fifo.set_paused( false );
        assert_eq!( fifo.pop( &mut out ), 4 );
        assert!( ( out[ 0 ] - 100.0 / 32768.0 ).abs() < 1e-6 );
    }


    #[test]
    fn test_mono_to_stereo_duplicates() {
        let fifo = PcmFifo::new( 16, 1, 2 );
        fifo.push( &[ 16384, -16384 ] );

        let mut out = [ 0.0f32; 4 ];
        assert_eq!( fifo.pop( &mut out ), 4 );
        assert_eq!( out[ 0 ], out[ 1 ] );
        assert_eq!( out[ 2 ], out[ 3 ] );
        assert!( ( out[ 0 ] - 0.5 ).abs() < 1e-6 );
        assert!( ( out[ 2 ] + 0.5 ).abs() < 1e-6 );
    }


    #[test]
    fn test_stereo_to_mono_mixes() {
        let fifo = PcmFifo::new( 16, 2, 1 );
        fifo.push( &[ 16384, 0 ] );

        let mut out = [ 0.0f32; 1 ];
        assert_eq!( fifo.pop( &mut out ), 1 );
        assert!( ( out[ 0 ] - 0.25 ).abs() < 1e-6 );
    }


    #[test]
    fn test_wide_remap_repeats_last_channel() {
        // Stereo session on a quad device: L R -> L R R R
        let fifo = PcmFifo::new( 16, 2, 4 );
        fifo.push( &[ 16384, -16384 ] );

        let mut out = [ 9.0f32; 4 ];
        assert_eq!( fifo.pop( &mut out ), 4 );
        assert!( ( out[ 0 ] - 0.5 ).abs() < 1e-6 );
        assert!( ( out[ 1 ] + 0.5 ).abs() < 1e-6 );
        assert_eq!( out[ 2 ], out[ 1 ] );
        assert_eq!( out[ 3 ], out[ 1 ] );
    }


    #[test]
    fn test_pop_ignores_partial_frames() {
        // 3 of 4 samples of a stereo frame pair queued: only the whole
        // frame is playable
        let fifo = PcmFifo::new( 16, 2, 2 );
        fifo.push( &[ 1, 2, 3 ] );

        let mut out = [ 9.0f32; 4 ];
        assert_eq!( fifo.pop( &mut out ), 2 );
        assert_eq!( fifo.len(), 1 );
    }


    #[test]
    fn test_clear_empties_queue() {
        let fifo = PcmFifo::new( 16, 2, 2 );
        fifo.push( &[ 1, 2, 3, 4 ] );
        fifo.clear();
        assert!( fifo.is_empty() );
    }
}
