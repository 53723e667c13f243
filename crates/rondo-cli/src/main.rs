//! Rondo CLI - Terminal front end for the playback engine

mod cli;

use std::io::{ self, Write };
use std::time::{ Duration, Instant };

use anyhow::Result;
use clap::Parser;
use crossterm::{
    event::{ self, Event, KeyCode, KeyEventKind, KeyModifiers },
    terminal::{ disable_raw_mode, enable_raw_mode, Clear, ClearType },
    ExecutableCommand,
};

use cli::Args;
use rondo_core::{ PlaybackState, Player };


/// Application state.
struct App {
    player: Player,
    should_quit: bool,

    // Volume mirror (0.0 to 2.0) so the status line tracks repeated steps
    volume: f32,

    // Speed the running session actually uses; the engine-stored value
    // diverges from this while a change staged by [ or ] awaits Enter
    applied_speed: f64,

    // Status message (shown at the end of the status line)
    status_message: Option<String>,
    status_clear_at: Option<Instant>,
}


impl App {
    /// Creates the application and applies any startup volume and speed.
    fn new( args: &Args ) -> Result<Self> {
        let player = Player::new()?;

        let volume = match args.volume {
            Some( percent ) => player.set_volume( percent as f32 / 100.0 ),
            None => player.volume(),
        };

        // Sessions start with the stored speed, so no apply is needed here
        if let Some( factor ) = args.speed {
            let stored = player.set_speed( factor );
            if ( stored - factor ).abs() > f64::EPSILON {
                tracing::warn!( "Requested speed {} out of range, using {}", factor, stored );
            }
        }
        let applied_speed = player.speed();

        Ok( Self {
            player,
            should_quit: false,
            volume,
            applied_speed,
            status_message: None,
            status_clear_at: None,
        })
    }


    /// Sets a status message that auto-clears after a delay.
    fn set_status( &mut self, msg: impl Into<String> ) {
        self.status_message = Some( msg.into() );
        self.status_clear_at = Some( Instant::now() + Duration::from_secs( 3 ) );
    }


    /// Updates app state between key events.
    fn tick( &mut self ) {
        // Clear expired status messages
        if let Some( clear_at ) = self.status_clear_at {
            if Instant::now() >= clear_at {
                self.status_message = None;
                self.status_clear_at = None;
            }
        }

        // Single-track player: once the session is gone there is nothing
        // left to control
        if self.player.state() == PlaybackState::Stopped {
            self.should_quit = true;
        }
    }


    /// Handles a key event.
    fn handle_key( &mut self, code: KeyCode, modifiers: KeyModifiers ) {
        match code {
            KeyCode::Char( 'q' ) => {
                self.should_quit = true;
            }
            KeyCode::Char( 'c' ) if modifiers.contains( KeyModifiers::CONTROL ) => {
                self.should_quit = true;
            }
            KeyCode::Char( ' ' ) => {
                let _ = self.player.toggle_pause();
            }
            KeyCode::Char( 's' ) => {
                if let Err( e ) = self.player.stop() {
                    self.set_status( format!( "Stop error: {}", e ) );
                }
            }
            KeyCode::Left => {
                // Seek backward 5 seconds
                let target = self.player.position_seconds() - 5.0;
                if let Err( e ) = self.player.seek( target.max( 0.0 ) ) {
                    self.set_status( format!( "Seek error: {}", e ) );
                }
            }
            KeyCode::Right => {
                // Seek forward 5 seconds
                let target = self.player.position_seconds() + 5.0;
                if let Some( duration ) = self.player.duration_seconds() {
                    if target >= duration {
                        return;
                    }
                }
                if let Err( e ) = self.player.seek( target ) {
                    self.set_status( format!( "Seek error: {}", e ) );
                }
            }
            KeyCode::Up => {
                // Volume up
                self.volume = self.player.set_volume( self.volume + 0.05 );
            }
            KeyCode::Down => {
                // Volume down
                self.volume = self.player.set_volume( self.volume - 0.05 );
            }
            KeyCode::Char( '[' ) => {
                self.player.set_speed( self.player.speed() - 0.25 );
            }
            KeyCode::Char( ']' ) => {
                self.player.set_speed( self.player.speed() + 0.25 );
            }
            KeyCode::Enter => {
                // One restart no matter how many steps were staged
                if ( self.player.speed() - self.applied_speed ).abs() > f64::EPSILON {
                    self.player.apply_speed();
                    self.applied_speed = self.player.speed();
                    self.set_status( format!( "Speed: {:.2}x", self.applied_speed ) );
                }
            }
            _ => {}
        }
    }


    /// Redraws the single status line in place.
    fn draw_status( &self ) -> io::Result<()> {
        let glyph = match self.player.state() {
            PlaybackState::Playing => "▶",
            PlaybackState::Paused => "⏸",
            PlaybackState::Stopped => "■",
        };

        let position = format_time( self.player.position_seconds() );
        let time = match self.player.duration_seconds() {
            Some( total ) => format!( "{} / {}", position, format_time( total ) ),
            None => position,
        };

        let track = self.player.current_track()
            .and_then( |p| p.file_name().map( |n| n.to_string_lossy().to_string() ) )
            .unwrap_or_else( || "-".to_string() );

        let stored = self.player.speed();
        let speed = if ( stored - self.applied_speed ).abs() > f64::EPSILON {
            format!( "{:.2}x*", stored )
        } else {
            format!( "{:.2}x", stored )
        };

        let mut line = format!(
            " {} {}  {}  vol {}%  speed {}",
            glyph,
            track,
            time,
            ( self.volume * 100.0 ).round() as i32,
            speed
        );
        if let Some( ref msg ) = self.status_message {
            line.push_str( "  | " );
            line.push_str( msg );
        }

        let mut stdout = io::stdout();
        stdout.execute( Clear( ClearType::CurrentLine ) )?;
        write!( stdout, "\r{}", line )?;
        stdout.flush()
    }
}


/// Formats a position in seconds as M:SS.
fn format_time( seconds: f64 ) -> String {
    let secs = seconds.max( 0.0 ) as u64;
    format!( "{}:{:02}", secs / 60, secs % 60 )
}


fn run_loop( app: &mut App ) -> Result<()> {
    loop {
        // Update state
        app.tick();

        // Redraw the status line
        app.draw_status()?;

        // Handle events with timeout
        if event::poll( Duration::from_millis( 100 ) )? {
            match event::read()? {
                Event::Key( key ) if key.kind == KeyEventKind::Press => {
                    app.handle_key( key.code, key.modifiers );
                }
                _ => {}
            }
        }

        if app.should_quit {
            break;
        }
    }
    Ok(())
}


fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else( |_| tracing_subscriber::EnvFilter::new( "warn" ) ),
        )
        .with_writer( io::stderr )
        .init();

    // Start playback before entering raw mode so startup errors print cleanly
    let mut app = App::new( &args )?;
    app.player.play( args.input.clone() )?;

    enable_raw_mode()?;
    let outcome = run_loop( &mut app );
    disable_raw_mode()?;

    // Move past the status line
    println!();

    outcome?;

    if let Some( reason ) = app.player.session_error() {
        anyhow::bail!( "Playback failed: {}", reason );
    }
    if app.player.track_ended() {
        println!( "Finished: {}", args.input.display() );
    }
    Ok(())
}
