//! Engine facade
//!
//! The Player struct owns the playback session and exposes the thread-safe
//! control surface: play, pause, seek, speed, volume, and position queries.

use std::path::{ Path, PathBuf };
use std::sync::{ Arc, RwLock };
use std::sync::mpsc::{ self, Sender };
use std::thread;
use std::time::{ Duration, Instant };

use thiserror::Error;

use crate::engine::{ Command, PlaybackLoop, SessionEnd, SessionShared };
use crate::output::{ AudioSink, DeviceSink, OutputError };
use crate::probe::{ probe_format, TrackFormat };
use crate::source::{ FfmpegFactory, SourceFactory };


/// Volume is a linear gain in [0.0, 2.0].
pub const MAX_VOLUME: f32 = 2.0;

/// Speed bounds; two atempo stages cover this whole range.
pub const MIN_SPEED: f64 = 0.25;
pub const MAX_SPEED: f64 = 3.0;

/// How long stop() waits for the session thread before force-killing the
/// decode source out from under it.
const STOP_DEADLINE: Duration = Duration::from_secs( 2 );
const STOP_POLL: Duration = Duration::from_millis( 10 );


/// Errors that can occur when starting or controlling playback.
#[derive( Debug, Error )]
pub enum PlayerError {
    #[error( "Failed to open source: {0}" )]
    Source( String ),

    #[error( "Audio output error: {0}" )]
    Output( String ),

    #[error( "No track loaded" )]
    NoTrack,
}


/// Current playback state.
#[derive( Debug, Clone, Copy, PartialEq, Eq )]
pub enum PlaybackState {
    Stopped,
    Playing,
    Paused,
}


/// Everything the engine needs from the platform: format probing, decode
/// source construction, and the audio device. Swappable for tests.
pub trait AudioBackend: Send + Sync {
    fn probe( &self, path: &Path ) -> TrackFormat;

    fn source_factory( &self, path: &Path, format: TrackFormat ) -> Box<dyn SourceFactory>;

    fn open_sink( &self, format: &TrackFormat ) -> Result<Box<dyn AudioSink>, OutputError>;
}


/// Production backend: ffprobe, ffmpeg, and the default cpal device.
pub struct SystemBackend;


impl AudioBackend for SystemBackend {
    fn probe( &self, path: &Path ) -> TrackFormat {
        probe_format( path )
    }


    fn source_factory( &self, path: &Path, format: TrackFormat ) -> Box<dyn SourceFactory> {
        Box::new( FfmpegFactory::new( path.to_path_buf(), format ) )
    }


    fn open_sink( &self, format: &TrackFormat ) -> Result<Box<dyn AudioSink>, OutputError> {
        Ok( Box::new( DeviceSink::open( format )? ) )
    }
}


/// Live playback session owned by the facade.
struct SessionHandle {
    shared: Arc<SessionShared>,
    commands: Sender<Command>,
    thread: Option<thread::JoinHandle<()>>,
    format: TrackFormat,
}


/// Streaming playback engine.
///
/// All methods take &self and are safe to call from any thread; at most one
/// track plays at a time, and starting a new one stops the old one first.
pub struct Player {
    backend: Arc<dyn AudioBackend>,
    session: Arc<RwLock<Option<SessionHandle>>>,
    current_track: Arc<RwLock<Option<PathBuf>>>,
    /// Volume level (0.0 to 2.0), persisted across track changes
    volume: Arc<RwLock<f32>>,
    /// Speed factor (0.25 to 3.0), persisted across track changes
    speed: Arc<RwLock<f64>>,
    on_end: Arc<RwLock<Option<Arc<dyn Fn() + Send + Sync>>>>,
}


impl Player {
    /// Creates a new Player using the system audio stack.
    pub fn new() -> Result<Self, PlayerError> {
        Ok( Self::with_backend( Arc::new( SystemBackend ) ) )
    }


    /// Creates a Player on top of a custom backend.
    pub fn with_backend( backend: Arc<dyn AudioBackend> ) -> Self {
        Self {
            backend,
            session: Arc::new( RwLock::new( None ) ),
            current_track: Arc::new( RwLock::new( None ) ),
            volume: Arc::new( RwLock::new( 1.0 ) ),
            speed: Arc::new( RwLock::new( 1.0 ) ),
            on_end: Arc::new( RwLock::new( None ) ),
        }
    }


    /// Starts playback of the specified file or stream URL from the
    /// beginning, stopping any current session first.
    pub fn play( &self, path: PathBuf ) -> Result<(), PlayerError> {
        // Stop any current playback
        self.stop()?;

        tracing::info!( "Playing: {:?}", path );

        let format = self.backend.probe( &path );
        let factory = self.backend.source_factory( &path, format );

        let speed = *self.speed.read().unwrap();
        let source = factory
            .open( 0.0, speed )
            .map_err( |e| PlayerError::Source( e.to_string() ) )?;

        let sink = self.backend
            .open_sink( &format )
            .map_err( |e| PlayerError::Output( e.to_string() ) )?;

        let volume = *self.volume.read().unwrap();
        let shared = Arc::new( SessionShared::new( volume ) );
        let ( commands, command_rx ) = mpsc::channel();
        let on_end = self.on_end.read().unwrap().clone();

        let playback = PlaybackLoop::new(
            source,
            factory,
            sink,
            format,
            speed,
            Arc::clone( &shared ),
            command_rx,
            on_end,
        );
        let thread = thread::spawn( move || playback.run() );

        // Store session handle
        {
            let mut session = self.session.write().unwrap();
            *session = Some( SessionHandle {
                shared,
                commands,
                thread: Some( thread ),
                format,
            });
        }

        {
            let mut track = self.current_track.write().unwrap();
            *track = Some( path );
        }

        Ok(())
    }


    /// Pauses playback. The device keeps running and emits silence.
    pub fn pause( &self ) -> Result<(), PlayerError> {
        let session = self.session.read().unwrap();
        if let Some( ref handle ) = *session {
            handle.shared.set_paused( true );
            tracing::info!( "Paused" );
        }
        Ok(())
    }


    /// Resumes playback exactly where it paused.
    pub fn resume( &self ) -> Result<(), PlayerError> {
        let session = self.session.read().unwrap();
        if let Some( ref handle ) = *session {
            handle.shared.set_paused( false );
            tracing::info!( "Resumed" );
        }
        Ok(())
    }


    /// Pauses when playing, resumes when paused. No-op when stopped.
    pub fn toggle_pause( &self ) -> Result<(), PlayerError> {
        let session = self.session.read().unwrap();
        if let Some( ref handle ) = *session {
            let paused = handle.shared.is_paused();
            handle.shared.set_paused( !paused );
            tracing::info!( "{}", if paused { "Resumed" } else { "Paused" } );
        }
        Ok(())
    }


    /// Stops playback and discards anything still buffered.
    ///
    /// Waits a bounded time for the session thread; if the thread is stuck
    /// on a stalled source the source is killed out from under it, after
    /// which the join is guaranteed to finish.
    pub fn stop( &self ) -> Result<(), PlayerError> {
        let mut session = self.session.write().unwrap();

        if let Some( mut handle ) = session.take() {
            handle.shared.request_stop();
            let _ = handle.commands.send( Command::Stop );

            let deadline = Instant::now() + STOP_DEADLINE;
            while !handle.shared.has_exited() && Instant::now() < deadline {
                thread::sleep( STOP_POLL );
            }
            if !handle.shared.has_exited() {
                tracing::warn!( "Playback loop unresponsive, force-killing source" );
                handle.shared.kill_source();
            }

            if let Some( thread ) = handle.thread.take() {
                let _ = thread.join();
            }

            // The sink was owned by the loop and is gone with it
            tracing::info!( "Stopped" );
        }

        {
            let mut track = self.current_track.write().unwrap();
            *track = None;
        }

        Ok(())
    }


    /// Requests a jump to an absolute position in seconds, clamped to the
    /// track bounds. Silently ignored when the track's duration is unknown,
    /// since there is no end to clamp against.
    pub fn seek( &self, seconds: f64 ) -> Result<(), PlayerError> {
        let session = self.session.read().unwrap();
        let handle = session.as_ref().ok_or( PlayerError::NoTrack )?;

        let Some( duration ) = handle.format.duration else {
            tracing::debug!( "Ignoring seek: track duration unknown" );
            return Ok(());
        };

        let target = seconds.clamp( 0.0, duration );
        handle.commands
            .send( Command::Seek( target ) )
            .map_err( |_| PlayerError::NoTrack )?;
        tracing::info!( "Seeking to {:.3}s", target );
        Ok(())
    }


    /// Stores the playback speed factor and returns the clamped value.
    ///
    /// A running session keeps its current rate until apply_speed(), so a
    /// control surface can step through several values and pay for one
    /// decoder restart. The stored value persists across tracks and new
    /// sessions start with it.
    pub fn set_speed( &self, factor: f64 ) -> f64 {
        let factor = factor.clamp( MIN_SPEED, MAX_SPEED );
        let mut speed = self.speed.write().unwrap();
        *speed = factor;
        factor
    }


    /// Restarts the live session at the current position with the stored
    /// speed factor. No-op when nothing is playing.
    pub fn apply_speed( &self ) {
        let factor = *self.speed.read().unwrap();
        let session = self.session.read().unwrap();
        if let Some( ref handle ) = *session {
            let _ = handle.commands.send( Command::SetSpeed( factor ) );
            tracing::info!( "Playback speed set to {:.2}x", factor );
        }
    }


    /// Gets the current speed factor.
    pub fn speed( &self ) -> f64 {
        *self.speed.read().unwrap()
    }


    /// Sets the volume (0.0 = mute, 1.0 = normal, up to 2.0 = boost) and
    /// returns the applied, clamped value. Persists across tracks.
    pub fn set_volume( &self, volume: f32 ) -> f32 {
        let volume = volume.clamp( 0.0, MAX_VOLUME );
        {
            let mut vol = self.volume.write().unwrap();
            *vol = volume;
        }

        // Apply to current playback if any
        let session = self.session.read().unwrap();
        if let Some( ref handle ) = *session {
            handle.shared.set_volume( volume );
        }
        volume
    }


    /// Gets the current volume level.
    pub fn volume( &self ) -> f32 {
        *self.volume.read().unwrap()
    }


    /// Gets the current playback state.
    pub fn state( &self ) -> PlaybackState {
        let session = self.session.read().unwrap();
        match session.as_ref() {
            Some( handle ) if !handle.shared.has_exited() => {
                if handle.shared.is_paused() {
                    PlaybackState::Paused
                } else {
                    PlaybackState::Playing
                }
            }
            _ => PlaybackState::Stopped,
        }
    }


    /// Gets the current track path, if any.
    pub fn current_track( &self ) -> Option<PathBuf> {
        self.current_track.read().unwrap().clone()
    }


    /// Gets the current playback position in seconds, derived from the
    /// audio actually handed to the device.
    pub fn position_seconds( &self ) -> f64 {
        let session = self.session.read().unwrap();
        if let Some( ref handle ) = *session {
            handle.format.bytes_to_seconds( handle.shared.position_bytes() )
        } else {
            0.0
        }
    }


    /// Gets the total duration of the current track in seconds, when the
    /// container reports one.
    pub fn duration_seconds( &self ) -> Option<f64> {
        let session = self.session.read().unwrap();
        session.as_ref().and_then( |h| h.format.duration )
    }


    /// Returns true if the current track ended on its own (end of stream
    /// reached). Never set by stop(). Reset when a new track starts.
    pub fn track_ended( &self ) -> bool {
        let session = self.session.read().unwrap();
        session.as_ref()
            .map( |h| h.shared.has_ended() )
            .unwrap_or( false )
    }


    /// Returns the failure message if the current session died on an error.
    pub fn session_error( &self ) -> Option<String> {
        let session = self.session.read().unwrap();
        match session.as_ref().and_then( |h| h.shared.end() ) {
            Some( SessionEnd::Failed( msg ) ) => Some( msg ),
            _ => None,
        }
    }


    /// Registers a callback fired once per track when it ends on its own.
    ///
    /// The callback runs on the session thread and must not call back into
    /// the Player; poll track_ended() instead for auto-advance flows.
    /// Applies to sessions started after registration.
    pub fn on_track_end<F>( &self, callback: F )
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut on_end = self.on_end.write().unwrap();
        *on_end = Some( Arc::new( callback ) );
    }
}


impl Default for Player {
    fn default() -> Self {
        Self::with_backend( Arc::new( SystemBackend ) )
    }
}


impl Drop for Player {
    fn drop( &mut self ) {
        // Ensure playback is stopped when the player is dropped
        let _ = self.stop();
    }
}


#[cfg( test )]
mod tests {
    use super::*;

    use std::sync::Mutex;
    use std::sync::atomic::{ AtomicBool, AtomicUsize, Ordering };

    use crate::source::{ PcmSource, SourceError };


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


    /// Source that yields one fixed payload, or data forever when endless.
    struct MockSource {
        payload: Option<Vec<u8>>,
        endless: bool,
        live: Arc<AtomicUsize>,
        stopped: bool,
    }


    impl PcmSource for MockSource {
        fn read( &mut self, buf: &mut [u8] ) -> std::io::Result<usize> {
            if self.endless {
                thread::sleep( Duration::from_millis( 1 ) );
                let n = buf.len().min( 64 );
                for b in buf[ ..n ].iter_mut() {
                    *b = 0;
                }
                return Ok( n );
            }
            match self.payload.take() {
                Some( payload ) => {
                    let n = payload.len().min( buf.len() );
                    buf[ ..n ].copy_from_slice( &payload[ ..n ] );
                    Ok( n )
                }
                None => Ok( 0 ),
            }
        }


        fn stop( &mut self ) {
            if !self.stopped {
                self.stopped = true;
                self.live.fetch_sub( 1, Ordering::Relaxed );
            }
        }
    }


    struct MockFactory {
        payload: Vec<u8>,
        endless: bool,
        opens: Arc<Mutex<Vec<( f64, f64 )>>>,
        live: Arc<AtomicUsize>,
    }


    impl SourceFactory for MockFactory {
        fn open( &self, offset_secs: f64, speed: f64 ) -> Result<Box<dyn PcmSource>, SourceError> {
            self.opens.lock().unwrap().push( ( offset_secs, speed ) );
            self.live.fetch_add( 1, Ordering::Relaxed );
            Ok( Box::new( MockSource {
                payload: Some( self.payload.clone() ),
                endless: self.endless,
                live: Arc::clone( &self.live ),
                stopped: false,
            }))
        }
    }


    struct MemorySink {
        written: Arc<Mutex<Vec<i16>>>,
        paused: Arc<AtomicBool>,
    }


    impl AudioSink for MemorySink {
        fn write( &mut self, samples: &[i16] ) -> usize {
            self.written.lock().unwrap().extend_from_slice( samples );
            samples.len()
        }


        fn set_paused( &self, paused: bool ) {
            self.paused.store( paused, Ordering::Relaxed );
        }


        fn discard( &self ) {}


        fn buffered( &self ) -> usize {
            0
        }
    }


    struct MockBackend {
        format: TrackFormat,
        payload: Vec<u8>,
        endless: bool,
        fail_sink: bool,
        opens: Arc<Mutex<Vec<( f64, f64 )>>>,
        live: Arc<AtomicUsize>,
        written: Arc<Mutex<Vec<i16>>>,
        sink_paused: Arc<AtomicBool>,
    }


    impl MockBackend {
        fn new( payload: Vec<u8>, endless: bool ) -> Self {
            Self {
                format: TrackFormat { sample_rate: 44100, channels: 2, duration: Some( 30.0 ) },
                payload,
                endless,
                fail_sink: false,
                opens: Arc::new( Mutex::new( Vec::new() ) ),
                live: Arc::new( AtomicUsize::new( 0 ) ),
                written: Arc::new( Mutex::new( Vec::new() ) ),
                sink_paused: Arc::new( AtomicBool::new( false ) ),
            }
        }
    }


    impl AudioBackend for MockBackend {
        fn probe( &self, _path: &Path ) -> TrackFormat {
            self.format
        }


        fn source_factory( &self, _path: &Path, _format: TrackFormat ) -> Box<dyn SourceFactory> {
            Box::new( MockFactory {
                payload: self.payload.clone(),
                endless: self.endless,
                opens: Arc::clone( &self.opens ),
                live: Arc::clone( &self.live ),
            })
        }


        fn open_sink( &self, _format: &TrackFormat ) -> Result<Box<dyn AudioSink>, OutputError> {
            if self.fail_sink {
                return Err( OutputError::NoDevice );
            }
            Ok( Box::new( MemorySink {
                written: Arc::clone( &self.written ),
                paused: Arc::clone( &self.sink_paused ),
            }))
        }
    }


    fn pcm( samples: &[i16] ) -> Vec<u8> {
        samples.iter().flat_map( |s| s.to_le_bytes() ).collect()
    }


    #[test]
    fn test_play_to_natural_end_sets_track_ended() {
        let backend = Arc::new( MockBackend::new( pcm( &[ 10, 20, 30, 40 ] ), false ) );
        let player = Player::with_backend( backend.clone() );

        let ends = Arc::new( AtomicUsize::new( 0 ) );
        let ends_clone = Arc::clone( &ends );
        player.on_track_end( move || {
            ends_clone.fetch_add( 1, Ordering::Relaxed );
        });

        player.play( PathBuf::from( "track.mp3" ) ).unwrap();
        assert!( wait_until( || player.track_ended() ) );
        assert!( wait_until( || player.state() == PlaybackState::Stopped ) );

        assert_eq!( *backend.written.lock().unwrap(), vec![ 10, 20, 30, 40 ] );
        assert_eq!( ends.load( Ordering::Relaxed ), 1 );
        assert!( player.session_error().is_none() );
    }


    #[test]
    fn test_stop_never_reports_track_ended() {
        let backend = Arc::new( MockBackend::new( Vec::new(), true ) );
        let player = Player::with_backend( backend );

        player.play( PathBuf::from( "track.mp3" ) ).unwrap();
        assert!( wait_until( || player.position_seconds() > 0.0 ) );

        player.stop().unwrap();
        assert_eq!( player.state(), PlaybackState::Stopped );
        assert!( !player.track_ended() );
        assert_eq!( player.current_track(), None );

        // Stopping again is a no-op
        player.stop().unwrap();
    }


    #[test]
    fn test_replacing_play_leaves_one_live_source() {
        let backend = Arc::new( MockBackend::new( Vec::new(), true ) );
        let player = Player::with_backend( backend.clone() );

        player.play( PathBuf::from( "a.mp3" ) ).unwrap();
        player.play( PathBuf::from( "b.mp3" ) ).unwrap();

        // play() tears the first session down before the second opens, so
        // only the replacement's source is ever alive
        assert_eq!( backend.live.load( Ordering::Relaxed ), 1 );
        assert_eq!( backend.opens.lock().unwrap().len(), 2 );
        assert_eq!( player.current_track(), Some( PathBuf::from( "b.mp3" ) ) );

        player.stop().unwrap();
        assert_eq!( backend.live.load( Ordering::Relaxed ), 0 );
    }


    #[test]
    fn test_pause_and_resume_round_trip() {
        let backend = Arc::new( MockBackend::new( Vec::new(), true ) );
        let player = Player::with_backend( backend.clone() );

        player.play( PathBuf::from( "track.mp3" ) ).unwrap();
        assert_eq!( player.state(), PlaybackState::Playing );

        player.pause().unwrap();
        assert_eq!( player.state(), PlaybackState::Paused );
        assert!( wait_until( || backend.sink_paused.load( Ordering::Relaxed ) ) );

        let held = player.position_seconds();
        thread::sleep( Duration::from_millis( 50 ) );
        assert_eq!( player.position_seconds(), held );

        player.resume().unwrap();
        assert_eq!( player.state(), PlaybackState::Playing );
        assert!( wait_until( || player.position_seconds() > held ) );

        player.stop().unwrap();
    }


    #[test]
    fn test_seek_forwards_to_session() {
        let backend = Arc::new( MockBackend::new( Vec::new(), true ) );
        let player = Player::with_backend( backend.clone() );

        player.play( PathBuf::from( "track.mp3" ) ).unwrap();
        player.seek( 30.0 ).unwrap();

        assert!( wait_until( || backend.opens.lock().unwrap().len() == 2 ) );
        assert_eq!( backend.opens.lock().unwrap()[ 1 ], ( 30.0, 1.0 ) );
        assert!( wait_until( || player.position_seconds() >= 30.0 ) );

        player.stop().unwrap();
    }


    #[test]
    fn test_seek_clamps_to_track_bounds() {
        let backend = Arc::new( MockBackend::new( Vec::new(), true ) );
        let player = Player::with_backend( backend.clone() );

        player.play( PathBuf::from( "track.mp3" ) ).unwrap();
        player.seek( 500.0 ).unwrap();

        assert!( wait_until( || backend.opens.lock().unwrap().len() == 2 ) );
        assert_eq!( backend.opens.lock().unwrap()[ 1 ].0, 30.0 );

        player.seek( -3.0 ).unwrap();
        assert!( wait_until( || backend.opens.lock().unwrap().len() == 3 ) );
        assert_eq!( backend.opens.lock().unwrap()[ 2 ].0, 0.0 );

        player.stop().unwrap();
    }


    #[test]
    fn test_seek_with_unknown_duration_is_ignored() {
        let mut backend = MockBackend::new( Vec::new(), true );
        backend.format.duration = None;
        let backend = Arc::new( backend );
        let player = Player::with_backend( backend.clone() );

        player.play( PathBuf::from( "stream.mp3" ) ).unwrap();
        player.seek( 10.0 ).unwrap();

        thread::sleep( Duration::from_millis( 50 ) );
        assert_eq!( backend.opens.lock().unwrap().len(), 1 );

        player.stop().unwrap();
    }


    #[test]
    fn test_seek_without_session_is_rejected() {
        let backend = Arc::new( MockBackend::new( Vec::new(), false ) );
        let player = Player::with_backend( backend );

        assert!( matches!( player.seek( 5.0 ), Err( PlayerError::NoTrack ) ) );
    }


    #[test]
    fn test_volume_applies_to_session_and_persists() {
        let backend = Arc::new( MockBackend::new( pcm( &[ 1000, -1000 ] ), false ) );
        let player = Player::with_backend( backend.clone() );

        assert_eq!( player.set_volume( 0.5 ), 0.5 );
        player.play( PathBuf::from( "track.mp3" ) ).unwrap();
        assert!( wait_until( || player.track_ended() ) );

        assert_eq!( *backend.written.lock().unwrap(), vec![ 500, -500 ] );
        assert_eq!( player.volume(), 0.5 );
    }


    #[test]
    fn test_volume_and_speed_clamp() {
        let backend = Arc::new( MockBackend::new( Vec::new(), false ) );
        let player = Player::with_backend( backend );

        assert_eq!( player.set_volume( 9.0 ), MAX_VOLUME );
        assert_eq!( player.set_volume( -1.0 ), 0.0 );
        assert_eq!( player.set_speed( 10.0 ), MAX_SPEED );
        assert_eq!( player.set_speed( 0.01 ), MIN_SPEED );
    }


    #[test]
    fn test_speed_persists_into_next_session() {
        let backend = Arc::new( MockBackend::new( Vec::new(), true ) );
        let player = Player::with_backend( backend.clone() );

        player.set_speed( 1.5 );
        player.play( PathBuf::from( "track.mp3" ) ).unwrap();

        assert_eq!( backend.opens.lock().unwrap()[ 0 ], ( 0.0, 1.5 ) );
        player.stop().unwrap();
    }


    #[test]
    fn test_set_speed_waits_for_apply() {
        let backend = Arc::new( MockBackend::new( Vec::new(), true ) );
        let player = Player::with_backend( backend.clone() );

        player.play( PathBuf::from( "track.mp3" ) ).unwrap();

        // Stepping through values never touches the running session
        player.set_speed( 1.25 );
        player.set_speed( 2.0 );
        thread::sleep( Duration::from_millis( 50 ) );
        assert_eq!( backend.opens.lock().unwrap().len(), 1 );

        // Applying restarts once, at the last stored value
        player.apply_speed();
        assert!( wait_until( || backend.opens.lock().unwrap().len() == 2 ) );
        assert_eq!( backend.opens.lock().unwrap()[ 1 ].1, 2.0 );

        player.stop().unwrap();
    }


    #[test]
    fn test_apply_speed_without_session_is_noop() {
        let backend = Arc::new( MockBackend::new( Vec::new(), false ) );
        let player = Player::with_backend( backend );

        player.set_speed( 2.0 );
        player.apply_speed();
        assert_eq!( player.speed(), 2.0 );
    }


    #[test]
    fn test_toggle_pause_flips_state() {
        let backend = Arc::new( MockBackend::new( Vec::new(), true ) );
        let player = Player::with_backend( backend );

        player.play( PathBuf::from( "track.mp3" ) ).unwrap();
        assert_eq!( player.state(), PlaybackState::Playing );

        player.toggle_pause().unwrap();
        assert_eq!( player.state(), PlaybackState::Paused );

        player.toggle_pause().unwrap();
        assert_eq!( player.state(), PlaybackState::Playing );

        player.stop().unwrap();
        // Toggling with no session stays a no-op
        player.toggle_pause().unwrap();
        assert_eq!( player.state(), PlaybackState::Stopped );
    }


    #[test]
    fn test_sink_failure_surfaces_from_play() {
        let mut backend = MockBackend::new( Vec::new(), false );
        backend.fail_sink = true;
        let player = Player::with_backend( Arc::new( backend ) );

        assert!( matches!(
            player.play( PathBuf::from( "track.mp3" ) ),
            Err( PlayerError::Output( _ ) )
        ));
        assert_eq!( player.state(), PlaybackState::Stopped );
    }


    #[test]
    fn test_duration_comes_from_probe() {
        let backend = Arc::new( MockBackend::new( Vec::new(), true ) );
        let player = Player::with_backend( backend );

        assert_eq!( player.duration_seconds(), None );
        player.play( PathBuf::from( "track.mp3" ) ).unwrap();
        assert_eq!( player.duration_seconds(), Some( 30.0 ) );
        player.stop().unwrap();
    }
}
