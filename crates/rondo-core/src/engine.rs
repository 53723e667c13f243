//! Playback session engine
//!
//! One PlaybackLoop drives one track session: it pulls PCM from the decode
//! source, applies volume, and feeds the audio sink while watching a command
//! channel for seeks, speed changes, and stop requests.

use std::sync::{ Arc, Mutex };
use std::sync::atomic::{ AtomicBool, AtomicU32, AtomicU64, Ordering };
use std::sync::mpsc::{ Receiver, RecvTimeoutError, TryRecvError };
use std::thread;
use std::time::{ Duration, Instant };

use crate::output::AudioSink;
use crate::probe::TrackFormat;
use crate::source::{ PcmSource, SourceEnd, SourceFactory, SourceKill };


/// Bytes of PCM requested from the source per iteration.
const CHUNK_BYTES: usize = 16 * 1024;

/// Sleep while paused or waiting for FIFO room.
const IDLE_WAIT: Duration = Duration::from_millis( 10 );
const BACKPRESSURE_WAIT: Duration = Duration::from_millis( 5 );

/// Ceiling on the end-of-track drain so a wedged device cannot hang the
/// session exit.
const DRAIN_DEADLINE: Duration = Duration::from_secs( 2 );


/// Control messages accepted by a running session.
#[derive( Debug, Clone, Copy, PartialEq )]
pub enum Command {
    /// Restart decoding at this position, in seconds.
    Seek( f64 ),
    /// Restart decoding at the current position with a new speed factor.
    SetSpeed( f64 ),
    /// End the session without an end-of-track notification.
    Stop,
}


/// How a session finished.
#[derive( Debug, Clone, PartialEq )]
pub enum SessionEnd {
    /// The source ran out of audio and everything buffered was played.
    Completed,
    /// Ended by a stop request.
    Stopped,
    /// Ended by a source or device failure.
    Failed( String ),
}


/// State shared between the playback loop and the controlling thread.
///
/// Everything here is written by one side and read by the other; the atomics
/// are latches and counters, and `end` carries the final outcome.
pub struct SessionShared {
    /// PCM bytes handed to the sink since the session position was last set.
    bytes_written: AtomicU64,
    /// Volume stored as f32 bits.
    volume: AtomicU32,
    paused: AtomicBool,
    stop: AtomicBool,
    /// Set by the loop as its very last action.
    exited: AtomicBool,
    /// Set only when the track ended on its own.
    ended: AtomicBool,
    end: Mutex<Option<SessionEnd>>,
    /// Abort handle for the current source generation.
    kill: Mutex<SourceKill>,
}


impl SessionShared {
    pub fn new( volume: f32 ) -> Self {
        Self {
            bytes_written: AtomicU64::new( 0 ),
            volume: AtomicU32::new( volume.to_bits() ),
            paused: AtomicBool::new( false ),
            stop: AtomicBool::new( false ),
            exited: AtomicBool::new( false ),
            ended: AtomicBool::new( false ),
            end: Mutex::new( None ),
            kill: Mutex::new( SourceKill::none() ),
        }
    }


    /// PCM bytes written to the sink, measured from the session origin.
    pub fn position_bytes( &self ) -> u64 {
        self.bytes_written.load( Ordering::Relaxed )
    }


    fn set_bytes( &self, bytes: u64 ) {
        self.bytes_written.store( bytes, Ordering::Relaxed );
    }


    fn add_bytes( &self, bytes: u64 ) {
        self.bytes_written.fetch_add( bytes, Ordering::Relaxed );
    }


    pub fn volume( &self ) -> f32 {
        f32::from_bits( self.volume.load( Ordering::Relaxed ) )
    }


    pub fn set_volume( &self, volume: f32 ) {
        self.volume.store( volume.to_bits(), Ordering::Relaxed );
    }


    pub fn is_paused( &self ) -> bool {
        self.paused.load( Ordering::Relaxed )
    }


    pub fn set_paused( &self, paused: bool ) {
        self.paused.store( paused, Ordering::Relaxed );
    }


    pub fn request_stop( &self ) {
        self.stop.store( true, Ordering::Relaxed );
    }


    pub fn stop_requested( &self ) -> bool {
        self.stop.load( Ordering::Relaxed )
    }


    pub fn has_exited( &self ) -> bool {
        self.exited.load( Ordering::Relaxed )
    }


    fn mark_exited( &self ) {
        self.exited.store( true, Ordering::Relaxed );
    }


    /// True once the track has ended on its own (never set by Stop).
    pub fn has_ended( &self ) -> bool {
        self.ended.load( Ordering::Relaxed )
    }


    fn mark_ended( &self ) {
        self.ended.store( true, Ordering::Relaxed );
    }


    pub fn end( &self ) -> Option<SessionEnd> {
        self.end.lock().unwrap().clone()
    }


    fn set_end( &self, end: SessionEnd ) {
        *self.end.lock().unwrap() = Some( end );
    }


    fn set_kill( &self, kill: SourceKill ) {
        *self.kill.lock().unwrap() = kill;
    }


    /// Force-kills the current source generation from outside the loop,
    /// unblocking a reader stuck on a stalled stream.
    pub fn kill_source( &self ) {
        self.kill.lock().unwrap().kill();
    }
}


/// Scales samples in place. Results are clamped so boost cannot wrap.
fn apply_volume( samples: &mut [i16], volume: f32 ) {
    if ( volume - 1.0 ).abs() < 1e-3 {
        return;
    }
    for sample in samples.iter_mut() {
        let scaled = ( *sample as f32 * volume ).round();
        *sample = scaled.clamp( -32768.0, 32767.0 ) as i16;
    }
}


fn note_command( cmd: Command, seek: &mut Option<f64>, speed: &mut Option<f64>, stop: &mut bool ) {
    match cmd {
        Command::Seek( secs ) => *seek = Some( secs ),
        Command::SetSpeed( factor ) => *speed = Some( factor ),
        Command::Stop => *stop = true,
    }
}


/// The per-session loop that runs on its own thread.
///
/// Exactly one source generation is alive at any moment: a seek or speed
/// change stops the current source and opens a replacement before any
/// further audio is read.
pub struct PlaybackLoop {
    source: Box<dyn PcmSource>,
    factory: Box<dyn SourceFactory>,
    sink: Box<dyn AudioSink>,
    format: TrackFormat,
    speed: f64,
    shared: Arc<SessionShared>,
    commands: Receiver<Command>,
    on_end: Option<Arc<dyn Fn() + Send + Sync>>,
}


impl PlaybackLoop {
    pub fn new(
        source: Box<dyn PcmSource>,
        factory: Box<dyn SourceFactory>,
        sink: Box<dyn AudioSink>,
        format: TrackFormat,
        speed: f64,
        shared: Arc<SessionShared>,
        commands: Receiver<Command>,
        on_end: Option<Arc<dyn Fn() + Send + Sync>>,
    ) -> Self {
        shared.set_kill( source.kill_handle() );
        Self {
            source,
            factory,
            sink,
            format,
            speed,
            shared,
            commands,
            on_end,
        }
    }


    /// Runs the session to completion and publishes its outcome.
    pub fn run( mut self ) {
        let outcome = self.play_session();
        self.shutdown( outcome );
    }


    fn play_session( &mut self ) -> SessionEnd {
        let mut buf = vec![ 0u8; CHUNK_BYTES ];
        let mut samples: Vec<i16> = Vec::with_capacity( CHUNK_BYTES / 2 );
        // Carried half-sample from a read that ended mid-frame
        let mut lead = 0usize;
        // Command picked up while blocked elsewhere, handled next iteration
        let mut carried: Option<Command> = None;
        let mut sink_paused = false;

        loop {
            // Collect everything pending; the newest seek and speed win
            let mut pending_seek: Option<f64> = None;
            let mut pending_speed: Option<f64> = None;
            let mut stop_cmd = false;

            if let Some( cmd ) = carried.take() {
                note_command( cmd, &mut pending_seek, &mut pending_speed, &mut stop_cmd );
            }
            loop {
                match self.commands.try_recv() {
                    Ok( cmd ) => note_command( cmd, &mut pending_seek, &mut pending_speed, &mut stop_cmd ),
                    Err( TryRecvError::Empty ) => break,
                    Err( TryRecvError::Disconnected ) => {
                        // Controller is gone; nothing can resume us
                        stop_cmd = true;
                        break;
                    }
                }
            }

            if stop_cmd || self.shared.stop_requested() {
                tracing::debug!( "Playback loop: stop signal received" );
                return SessionEnd::Stopped;
            }

            if let Some( msg ) = self.sink.error() {
                return SessionEnd::Failed( format!( "Audio device failed: {}", msg ) );
            }

            // A seek and a speed change arriving together cost one restart
            if pending_seek.is_some() || pending_speed.is_some() {
                if let Some( factor ) = pending_speed {
                    self.speed = factor;
                }

                self.source.stop();

                let offset = match pending_seek {
                    Some( target ) => {
                        let target = target.max( 0.0 );
                        // Reposition the cursor before the new source exists
                        // so readers never see the stale position
                        self.shared.set_bytes( self.format.seconds_to_bytes( target ) );
                        target
                    }
                    None => self.format.bytes_to_seconds( self.shared.position_bytes() ),
                };

                self.sink.discard();
                lead = 0;

                match self.factory.open( offset, self.speed ) {
                    Ok( next ) => {
                        self.shared.set_kill( next.kill_handle() );
                        self.source = next;
                    }
                    Err( e ) => {
                        return SessionEnd::Failed( format!( "Failed to reopen source: {}", e ) );
                    }
                }
                tracing::debug!(
                    "Playback loop: restarted at {:.3}s, speed {:.2}x",
                    offset,
                    self.speed
                );
            }

            // Mirror the pause flag into the sink so it plays silence while
            // keeping its buffer
            let paused = self.shared.is_paused();
            if paused != sink_paused {
                self.sink.set_paused( paused );
                sink_paused = paused;
            }
            if paused {
                match self.commands.recv_timeout( IDLE_WAIT ) {
                    Ok( cmd ) => carried = Some( cmd ),
                    Err( RecvTimeoutError::Timeout ) => {}
                    Err( RecvTimeoutError::Disconnected ) => return SessionEnd::Stopped,
                }
                continue;
            }

            let n = match self.source.read( &mut buf[ lead.. ] ) {
                Ok( n ) => n,
                Err( e ) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err( e ) => {
                    return SessionEnd::Failed( format!( "Source read failed: {}", e ) );
                }
            };

            if n == 0 {
                // A force-killed source also surfaces here as end of stream,
                // so the stop flag decides whether this counts as finishing
                if self.shared.stop_requested() {
                    return SessionEnd::Stopped;
                }
                return match self.source.finish() {
                    SourceEnd::Completed => {
                        tracing::info!( "Playback loop: reached end of stream" );
                        SessionEnd::Completed
                    }
                    SourceEnd::Failed( reason ) => SessionEnd::Failed( reason ),
                };
            }

            let total = lead + n;
            let usable = total - ( total % 2 );
            samples.clear();
            samples.extend(
                buf[ ..usable ]
                    .chunks_exact( 2 )
                    .map( |c| i16::from_le_bytes( [ c[ 0 ], c[ 1 ] ] ) ),
            );
            if usable < total {
                buf[ 0 ] = buf[ usable ];
                lead = 1;
            } else {
                lead = 0;
            }

            apply_volume( &mut samples, self.shared.volume() );

            // Push with backpressure: retry while the FIFO is full, but bail
            // out for control traffic since every command invalidates
            // whatever is still unwritten
            let mut offset = 0;
            while offset < samples.len() {
                if self.shared.stop_requested() {
                    break;
                }
                match self.commands.try_recv() {
                    Ok( cmd ) => {
                        carried = Some( cmd );
                        break;
                    }
                    Err( TryRecvError::Empty ) => {}
                    Err( TryRecvError::Disconnected ) => break,
                }

                let pushed = self.sink.write( &samples[ offset.. ] );
                offset += pushed;
                if pushed == 0 {
                    // A dead device stops pulling from the FIFO, so a full
                    // sink is where its failure surfaces
                    if let Some( msg ) = self.sink.error() {
                        self.shared.add_bytes( ( offset * 2 ) as u64 );
                        return SessionEnd::Failed( format!( "Audio device failed: {}", msg ) );
                    }
                    thread::sleep( BACKPRESSURE_WAIT );
                }
            }

            self.shared.add_bytes( ( offset * 2 ) as u64 );
        }
    }


    fn shutdown( &mut self, outcome: SessionEnd ) {
        self.source.stop();

        if outcome == SessionEnd::Completed {
            // Let buffered audio play out, with a ceiling, and cut it short
            // if a stop arrives mid-drain
            self.sink.set_paused( false );
            let deadline = Instant::now() + DRAIN_DEADLINE;
            while self.sink.buffered() > 0 && Instant::now() < deadline {
                if self.shared.stop_requested() {
                    self.sink.discard();
                    break;
                }
                thread::sleep( IDLE_WAIT );
            }
        } else {
            self.sink.discard();
        }

        match &outcome {
            SessionEnd::Completed => tracing::info!( "Playback finished" ),
            SessionEnd::Stopped => tracing::debug!( "Playback stopped" ),
            SessionEnd::Failed( msg ) => tracing::error!( "Playback failed: {}", msg ),
        }

        let completed = outcome == SessionEnd::Completed;
        self.shared.set_end( outcome );
        if completed {
            self.shared.mark_ended();
            if let Some( on_end ) = &self.on_end {
                on_end();
            }
        }

        self.shared.mark_exited();
        tracing::debug!( "Playback loop: exiting" );
    }
}


#[cfg( test )]
mod tests {
    use super::*;

    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc::{ self, Sender };

    use crate::source::SourceError;


    fn format() -> TrackFormat {
        TrackFormat { sample_rate: 44100, channels: 2, duration: Some( 30.0 ) }
    }


    fn pcm( samples: &[i16] ) -> Vec<u8> {
        samples.iter().flat_map( |s| s.to_le_bytes() ).collect()
    }


    fn wait_until<F: Fn() -> bool>( cond: F ) -> bool {
        let deadline = Instant::now() + Duration::from_secs( 2 );
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep( Duration::from_millis( 5 ) );
        }
        false
    }


    /// Source that replays a script of read results, then reports EOF.
    struct ScriptedSource {
        chunks: VecDeque<Vec<u8>>,
        stops: Arc<AtomicUsize>,
    }


    impl PcmSource for ScriptedSource {
        fn read( &mut self, buf: &mut [u8] ) -> std::io::Result<usize> {
            match self.chunks.pop_front() {
                Some( chunk ) => {
                    let n = chunk.len().min( buf.len() );
                    buf[ ..n ].copy_from_slice( &chunk[ ..n ] );
                    if n < chunk.len() {
                        self.chunks.push_front( chunk[ n.. ].to_vec() );
                    }
                    Ok( n )
                }
                None => Ok( 0 ),
            }
        }


        fn stop( &mut self ) {
            self.stops.fetch_add( 1, Ordering::Relaxed );
        }
    }


    /// Factory that hands out one scripted source per open call.
    struct ScriptedFactory {
        sessions: Mutex<VecDeque<Vec<Vec<u8>>>>,
        opens: Arc<Mutex<Vec<( f64, f64 )>>>,
        stops: Arc<AtomicUsize>,
        fail_opens_after: usize,
    }


    impl SourceFactory for ScriptedFactory {
        fn open( &self, offset_secs: f64, speed: f64 ) -> Result<Box<dyn PcmSource>, SourceError> {
            let mut opens = self.opens.lock().unwrap();
            if opens.len() >= self.fail_opens_after {
                return Err( SourceError::MissingStdout );
            }
            opens.push( ( offset_secs, speed ) );

            let chunks = self.sessions.lock().unwrap().pop_front().unwrap_or_default();
            Ok( Box::new( ScriptedSource {
                chunks: chunks.into_iter().collect(),
                stops: Arc::clone( &self.stops ),
            }))
        }
    }


    /// Sink that records everything accepted and drains instantly.
    struct CaptureSink {
        written: Arc<Mutex<Vec<i16>>>,
        paused: Arc<AtomicBool>,
        discards: Arc<AtomicUsize>,
        on_first_write: Option<Box<dyn FnOnce() + Send>>,
    }


    impl AudioSink for CaptureSink {
        fn write( &mut self, samples: &[i16] ) -> usize {
            if let Some( hook ) = self.on_first_write.take() {
                hook();
            }
            self.written.lock().unwrap().extend_from_slice( samples );
            samples.len()
        }


        fn set_paused( &self, paused: bool ) {
            self.paused.store( paused, Ordering::Relaxed );
        }


        fn discard( &self ) {
            self.discards.fetch_add( 1, Ordering::Relaxed );
        }


        fn buffered( &self ) -> usize {
            0
        }
    }


    struct Fixture {
        playback: PlaybackLoop,
        tx: Sender<Command>,
        shared: Arc<SessionShared>,
        opens: Arc<Mutex<Vec<( f64, f64 )>>>,
        source_stops: Arc<AtomicUsize>,
        written: Arc<Mutex<Vec<i16>>>,
        sink_paused: Arc<AtomicBool>,
        discards: Arc<AtomicUsize>,
        ends: Arc<AtomicUsize>,
    }


    /// Builds a loop over scripted sources. `sessions[ n ]` is the list of
    /// read results for the n-th open; opens beyond `fail_opens_after` fail.
    fn fixture(
        sessions: Vec<Vec<Vec<u8>>>,
        fail_opens_after: usize,
        on_first_write: Option<Box<dyn FnOnce() + Send>>,
    ) -> Fixture {
        let opens = Arc::new( Mutex::new( Vec::new() ) );
        let source_stops = Arc::new( AtomicUsize::new( 0 ) );
        let factory = Box::new( ScriptedFactory {
            sessions: Mutex::new( sessions.into_iter().collect() ),
            opens: Arc::clone( &opens ),
            stops: Arc::clone( &source_stops ),
            fail_opens_after,
        });

        let written = Arc::new( Mutex::new( Vec::new() ) );
        let sink_paused = Arc::new( AtomicBool::new( false ) );
        let discards = Arc::new( AtomicUsize::new( 0 ) );
        let sink = Box::new( CaptureSink {
            written: Arc::clone( &written ),
            paused: Arc::clone( &sink_paused ),
            discards: Arc::clone( &discards ),
            on_first_write,
        });

        let ends = Arc::new( AtomicUsize::new( 0 ) );
        let ends_clone = Arc::clone( &ends );
        let on_end: Arc<dyn Fn() + Send + Sync> = Arc::new( move || {
            ends_clone.fetch_add( 1, Ordering::Relaxed );
        });

        let shared = Arc::new( SessionShared::new( 1.0 ) );
        let ( tx, rx ) = mpsc::channel();

        let source = factory.open( 0.0, 1.0 ).unwrap();
        let playback = PlaybackLoop::new(
            source,
            factory,
            sink,
            format(),
            1.0,
            Arc::clone( &shared ),
            rx,
            Some( on_end ),
        );

        Fixture {
            playback,
            tx,
            shared,
            opens,
            source_stops,
            written,
            sink_paused,
            discards,
            ends,
        }
    }


    #[test]
    fn test_natural_end_plays_everything_and_notifies_once() {
        let audio = [ 100i16, -100, 200, -200, 300, -300 ];
        let f = fixture( vec![ vec![ pcm( &audio ) ] ], usize::MAX, None );

        f.playback.run();

        assert_eq!( *f.written.lock().unwrap(), audio.to_vec() );
        assert_eq!( f.shared.position_bytes(), ( audio.len() * 2 ) as u64 );
        assert!( f.shared.has_ended() );
        assert!( f.shared.has_exited() );
        assert_eq!( f.shared.end(), Some( SessionEnd::Completed ) );
        assert_eq!( f.ends.load( Ordering::Relaxed ), 1 );
    }


    #[test]
    fn test_stop_command_skips_end_notification() {
        let f = fixture( vec![ vec![ pcm( &[ 1, 2, 3, 4 ] ) ] ], usize::MAX, None );
        f.tx.send( Command::Stop ).unwrap();

        f.playback.run();

        assert!( f.written.lock().unwrap().is_empty() );
        assert!( !f.shared.has_ended() );
        assert_eq!( f.shared.end(), Some( SessionEnd::Stopped ) );
        assert_eq!( f.ends.load( Ordering::Relaxed ), 0 );
        assert!( f.discards.load( Ordering::Relaxed ) >= 1 );
    }


    #[test]
    fn test_seek_restarts_source_at_target() {
        let first = pcm( &[ 1, 1, 1, 1 ] );
        let second = pcm( &[ 7, 7, 7, 7 ] );
        let f = fixture( vec![ vec![ first ], vec![ second ] ], usize::MAX, None );
        f.tx.send( Command::Seek( 5.0 ) ).unwrap();

        f.playback.run();

        // The pre-seek source was never read; its audio must not surface
        assert_eq!( *f.written.lock().unwrap(), vec![ 7, 7, 7, 7 ] );

        let opens = f.opens.lock().unwrap();
        assert_eq!( opens.len(), 2 );
        assert_eq!( opens[ 1 ], ( 5.0, 1.0 ) );

        // Position restarts from the seek target and advances from there
        let expected = format().seconds_to_bytes( 5.0 ) + 8;
        assert_eq!( f.shared.position_bytes(), expected );

        // One stop per source generation
        assert_eq!( f.source_stops.load( Ordering::Relaxed ), 2 );
        assert!( f.discards.load( Ordering::Relaxed ) >= 1 );
    }


    #[test]
    fn test_queued_seeks_coalesce_into_one_restart() {
        let f = fixture(
            vec![ vec![ pcm( &[ 1, 1 ] ) ], vec![ pcm( &[ 9, 9 ] ) ] ],
            usize::MAX,
            None,
        );
        f.tx.send( Command::Seek( 5.0 ) ).unwrap();
        f.tx.send( Command::Seek( 9.0 ) ).unwrap();
        f.tx.send( Command::Seek( 12.0 ) ).unwrap();

        f.playback.run();

        let opens = f.opens.lock().unwrap();
        assert_eq!( opens.len(), 2 );
        assert_eq!( opens[ 1 ], ( 12.0, 1.0 ) );
    }


    #[test]
    fn test_negative_seek_clamps_to_start() {
        let f = fixture( vec![ Vec::new(), vec![ pcm( &[ 3, 3 ] ) ] ], usize::MAX, None );
        f.tx.send( Command::Seek( -4.0 ) ).unwrap();

        f.playback.run();

        let opens = f.opens.lock().unwrap();
        assert_eq!( opens[ 1 ].0, 0.0 );
        assert_eq!( f.shared.position_bytes(), 4 );
    }


    #[test]
    fn test_speed_change_restarts_at_current_position() {
        let first = pcm( &[ 5i16; 8 ] );
        let second = pcm( &[ 6i16; 4 ] );

        // Deliver the speed command only after the first chunk is in flight
        let ( hook_tx, hook_rx ) = mpsc::channel::<Sender<Command>>();
        let hook = Box::new( move || {
            let tx = hook_rx.recv().unwrap();
            tx.send( Command::SetSpeed( 2.0 ) ).unwrap();
        });

        let f = fixture( vec![ vec![ first ], vec![ second ] ], usize::MAX, Some( hook ) );
        hook_tx.send( f.tx.clone() ).unwrap();

        f.playback.run();

        let opens = f.opens.lock().unwrap();
        assert_eq!( opens.len(), 2 );
        assert_eq!( opens[ 1 ].1, 2.0 );

        // Restart offset derives from the 16 bytes already written
        let expected_offset = format().bytes_to_seconds( 16 );
        assert!( ( opens[ 1 ].0 - expected_offset ).abs() < 1e-9 );

        // The cursor keeps its value across a speed change
        assert_eq!( f.shared.position_bytes(), 16 + 8 );
        assert_eq!( f.written.lock().unwrap().len(), 12 );
    }


    #[test]
    fn test_seek_and_speed_together_cost_one_restart() {
        let f = fixture(
            vec![ vec![ pcm( &[ 1, 1 ] ) ], vec![ pcm( &[ 2, 2 ] ) ] ],
            usize::MAX,
            None,
        );
        f.tx.send( Command::SetSpeed( 1.5 ) ).unwrap();
        f.tx.send( Command::Seek( 8.0 ) ).unwrap();

        f.playback.run();

        let opens = f.opens.lock().unwrap();
        assert_eq!( opens.len(), 2 );
        assert_eq!( opens[ 1 ], ( 8.0, 1.5 ) );
    }


    #[test]
    fn test_decoder_death_surfaces_as_failure() {
        // Stream ends, but the decoder reports it died mid-track
        struct DyingSource;

        impl PcmSource for DyingSource {
            fn read( &mut self, _buf: &mut [u8] ) -> std::io::Result<usize> {
                Ok( 0 )
            }

            fn finish( &mut self ) -> SourceEnd {
                SourceEnd::Failed( "ffmpeg exited with signal: 9".to_string() )
            }

            fn stop( &mut self ) {}
        }

        let shared = Arc::new( SessionShared::new( 1.0 ) );
        let ( tx, rx ) = mpsc::channel();
        let factory = Box::new( ScriptedFactory {
            sessions: Mutex::new( VecDeque::new() ),
            opens: Arc::new( Mutex::new( Vec::new() ) ),
            stops: Arc::new( AtomicUsize::new( 0 ) ),
            fail_opens_after: usize::MAX,
        });
        let sink = Box::new( CaptureSink {
            written: Arc::new( Mutex::new( Vec::new() ) ),
            paused: Arc::new( AtomicBool::new( false ) ),
            discards: Arc::new( AtomicUsize::new( 0 ) ),
            on_first_write: None,
        });

        let playback = PlaybackLoop::new(
            Box::new( DyingSource ),
            factory,
            sink,
            format(),
            1.0,
            Arc::clone( &shared ),
            rx,
            None,
        );
        playback.run();
        drop( tx );

        assert!( shared.has_exited() );
        assert!( !shared.has_ended() );
        assert_eq!(
            shared.end(),
            Some( SessionEnd::Failed( "ffmpeg exited with signal: 9".to_string() ) )
        );
    }


    #[test]
    fn test_sink_failure_ends_session_with_error() {
        // The device died: the FIFO never drains and the stream reports why
        struct BrokenSink;

        impl AudioSink for BrokenSink {
            fn write( &mut self, _samples: &[i16] ) -> usize {
                0
            }

            fn set_paused( &self, _paused: bool ) {}

            fn discard( &self ) {}

            fn buffered( &self ) -> usize {
                0
            }

            fn error( &self ) -> Option<String> {
                Some( "device disconnected".to_string() )
            }
        }

        let shared = Arc::new( SessionShared::new( 1.0 ) );
        let ( _tx, rx ) = mpsc::channel();
        let factory = Box::new( ScriptedFactory {
            sessions: Mutex::new( vec![ vec![ pcm( &[ 1, 2, 3, 4 ] ) ] ].into_iter().collect() ),
            opens: Arc::new( Mutex::new( Vec::new() ) ),
            stops: Arc::new( AtomicUsize::new( 0 ) ),
            fail_opens_after: usize::MAX,
        });
        let source = factory.open( 0.0, 1.0 ).unwrap();

        let playback = PlaybackLoop::new(
            source,
            factory,
            Box::new( BrokenSink ),
            format(),
            1.0,
            Arc::clone( &shared ),
            rx,
            None,
        );
        playback.run();

        assert!( shared.has_exited() );
        assert!( !shared.has_ended() );
        match shared.end() {
            Some( SessionEnd::Failed( msg ) ) => assert!( msg.contains( "device disconnected" ) ),
            other => panic!( "unexpected outcome: {:?}", other ),
        }
    }


    #[test]
    fn test_restart_failure_ends_session_with_error() {
        let f = fixture( vec![ vec![ pcm( &[ 1, 1 ] ) ] ], 1, None );
        f.tx.send( Command::Seek( 3.0 ) ).unwrap();

        f.playback.run();

        assert!( f.shared.has_exited() );
        assert!( !f.shared.has_ended() );
        assert!( matches!( f.shared.end(), Some( SessionEnd::Failed( _ ) ) ) );
        assert_eq!( f.ends.load( Ordering::Relaxed ), 0 );
    }


    #[test]
    fn test_volume_scales_and_clamps() {
        let f = fixture(
            vec![ vec![ pcm( &[ 1000, -1000, 30000, -30000 ] ) ] ],
            usize::MAX,
            None,
        );
        f.shared.set_volume( 2.0 );

        f.playback.run();

        assert_eq!( *f.written.lock().unwrap(), vec![ 2000, -2000, 32767, -32768 ] );
    }


    #[test]
    fn test_unity_volume_passes_samples_through() {
        let audio = [ 12345i16, -12345, 1, -1 ];
        let f = fixture( vec![ vec![ pcm( &audio ) ] ], usize::MAX, None );

        f.playback.run();

        assert_eq!( *f.written.lock().unwrap(), audio.to_vec() );
    }


    #[test]
    fn test_odd_reads_carry_the_half_sample() {
        // 3 bytes then 2 bytes: one torn sample across the boundary, one
        // trailing half-sample dropped at EOF
        let f = fixture(
            vec![ vec![ vec![ 10, 0, 77 ], vec![ 0, 99 ] ] ],
            usize::MAX,
            None,
        );

        f.playback.run();

        assert_eq!( *f.written.lock().unwrap(), vec![ 10, 77 ] );
        assert_eq!( f.shared.position_bytes(), 4 );
        assert_eq!( f.shared.end(), Some( SessionEnd::Completed ) );
    }


    #[test]
    fn test_stop_flag_exits_paused_session() {
        let f = fixture( vec![ vec![ pcm( &[ 1, 2, 3, 4 ] ) ] ], usize::MAX, None );
        f.shared.set_paused( true );

        // Keep the sender alive so the loop does not treat a disconnected
        // channel as a stop request
        let Fixture { playback, shared, written, sink_paused, ends, tx: _tx, .. } = f;
        let loop_thread = thread::spawn( move || playback.run() );

        // The loop mirrors the pause into the sink and then idles
        assert!( wait_until( || sink_paused.load( Ordering::Relaxed ) ) );
        assert!( written.lock().unwrap().is_empty() );

        shared.request_stop();
        assert!( wait_until( || shared.has_exited() ) );
        loop_thread.join().unwrap();

        assert_eq!( shared.end(), Some( SessionEnd::Stopped ) );
        assert!( !shared.has_ended() );
        assert_eq!( ends.load( Ordering::Relaxed ), 0 );
    }


    #[test]
    fn test_seek_while_paused_repositions_and_stays_paused() {
        let f = fixture(
            vec![ vec![ pcm( &[ 1, 1 ] ) ], vec![ pcm( &[ 4, 4 ] ) ] ],
            usize::MAX,
            None,
        );
        f.shared.set_paused( true );

        let Fixture { playback, shared, tx, opens, sink_paused, written, .. } = f;
        let loop_thread = thread::spawn( move || playback.run() );

        assert!( wait_until( || sink_paused.load( Ordering::Relaxed ) ) );

        tx.send( Command::Seek( 6.0 ) ).unwrap();
        assert!( wait_until( || opens.lock().unwrap().len() == 2 ) );

        // Repositioned but still holding
        assert_eq!( shared.position_bytes(), format().seconds_to_bytes( 6.0 ) );
        assert!( shared.is_paused() );
        assert!( written.lock().unwrap().is_empty() );

        // Resume plays the post-seek audio
        shared.set_paused( false );
        assert!( wait_until( || shared.has_exited() ) );
        loop_thread.join().unwrap();

        assert_eq!( *written.lock().unwrap(), vec![ 4, 4 ] );
        assert_eq!( shared.end(), Some( SessionEnd::Completed ) );
    }


    #[test]
    fn test_apply_volume_near_unity_is_untouched() {
        let mut samples = [ 1000i16, -1000 ];
        apply_volume( &mut samples, 1.0004 );
        assert_eq!( samples, [ 1000, -1000 ] );
    }


    #[test]
    fn test_apply_volume_mute() {
        let mut samples = [ 1000i16, -32768, 32767 ];
        apply_volume( &mut samples, 0.0 );
        assert_eq!( samples, [ 0, 0, 0 ] );
    }
}
