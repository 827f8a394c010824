//! Record and playback sessions.
//!
//! A [`Session`] owns its recording and configuration outright; the
//! [`SessionRegistry`] only hands out shared handles. Everything a session
//! does to its own data happens here, synchronously, under the handle's lock.

pub mod registry;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use uuid::Uuid;

use crate::error::ProxyError;
use crate::matcher::MatcherConfig;
use crate::recording::{Exchange, InteractionLog, Recording, RequestRecord, ResponseRecord};
use crate::sanitize::{self, Sanitizer};
use crate::transform::{self, Transform};

pub use registry::{RegistryOptions, SessionRegistry, StartOptions, Started, StopOptions, Stopped};

/// Identifier of a session, carried in `x-recording-id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Wraps a UUID.
    #[must_use]
    pub fn new(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(raw.trim()).map(Self)
    }
}

/// What a session does with traffic. Fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Forward and capture.
    Record,
    /// Answer from a recording.
    Playback,
}

impl Mode {
    /// Lower-case name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Record => "record",
            Self::Playback => "playback",
        }
    }
}

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Started, no traffic yet; still configurable.
    Pending,
    /// Has recorded at least one exchange.
    Recording,
    /// Has served at least one playback request.
    Playback,
    /// Stopped; only reachable through a stale handle.
    Stopped,
}

impl SessionState {
    /// Lower-case name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "none",
            Self::Recording => "recording",
            Self::Playback => "playback",
            Self::Stopped => "stopped",
        }
    }
}

#[derive(Debug)]
enum Payload {
    Record(InteractionLog),
    Playback { recording: Recording, consumed: Vec<bool>, cursor: usize },
    Closed,
}

/// One record or playback session.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    mode: Mode,
    state: SessionState,
    recording_path: PathBuf,
    matcher: MatcherConfig,
    sanitizers: Vec<Sanitizer>,
    transforms: Vec<Transform>,
    payload: Payload,
}

impl Session {
    fn recorder(
        id: SessionId,
        recording_path: PathBuf,
        log: InteractionLog,
        matcher: MatcherConfig,
    ) -> Self {
        Self {
            id,
            mode: Mode::Record,
            state: SessionState::Pending,
            recording_path,
            matcher,
            sanitizers: Vec::new(),
            transforms: Vec::new(),
            payload: Payload::Record(log),
        }
    }

    fn player(
        id: SessionId,
        recording_path: PathBuf,
        recording: Recording,
        matcher: MatcherConfig,
        transforms: Vec<Transform>,
    ) -> Self {
        let consumed = vec![false; recording.interactions.len()];
        Self {
            id,
            mode: Mode::Playback,
            state: SessionState::Pending,
            recording_path,
            matcher,
            sanitizers: Vec::new(),
            transforms,
            payload: Payload::Playback { recording, consumed, cursor: 0 },
        }
    }

    /// Session id.
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Session mode.
    #[must_use]
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// File the recording is loaded from or flushed to.
    #[must_use]
    pub fn recording_path(&self) -> &std::path::Path {
        &self.recording_path
    }

    fn ensure_configurable(&self) -> Result<(), ProxyError> {
        if self.state == SessionState::Pending {
            Ok(())
        } else {
            Err(ProxyError::SessionImmutableState { session: self.id, state: self.state.as_str() })
        }
    }

    fn ensure_mode(&self, mode: Mode, operation: &'static str) -> Result<(), ProxyError> {
        if self.state == SessionState::Stopped {
            return Err(ProxyError::SessionNotFound(self.id.to_string()));
        }
        if self.mode == mode {
            Ok(())
        } else {
            Err(ProxyError::WrongMode { session: self.id, mode: self.mode.as_str(), operation })
        }
    }

    /// Adds a sanitizer, applied after the ones already registered.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::SessionImmutableState`] once traffic has flowed.
    pub fn add_sanitizer(&mut self, sanitizer: Sanitizer) -> Result<(), ProxyError> {
        self.ensure_configurable()?;
        self.sanitizers.push(sanitizer);
        Ok(())
    }

    /// Adds a response transform. Playback only.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::SessionImmutableState`] once traffic has flowed,
    /// or [`ProxyError::WrongMode`] for record sessions.
    pub fn add_transform(&mut self, transform: Transform) -> Result<(), ProxyError> {
        self.ensure_configurable()?;
        self.ensure_mode(Mode::Playback, "AddTransform")?;
        self.transforms.push(transform);
        Ok(())
    }

    /// Replaces the matcher configuration. Playback only.
    ///
    /// # Errors
    ///
    /// Same as [`Session::add_transform`].
    pub fn set_matcher(&mut self, matcher: MatcherConfig) -> Result<(), ProxyError> {
        self.ensure_configurable()?;
        self.ensure_mode(Mode::Playback, "SetMatcher")?;
        self.matcher = matcher;
        Ok(())
    }

    /// Appends a completed exchange and returns its ordinal.
    ///
    /// # Errors
    ///
    /// Returns an error for playback sessions, stopped sessions, or when the
    /// journal write fails.
    pub fn record(&mut self, exchange: Exchange) -> Result<u64, ProxyError> {
        self.ensure_mode(Mode::Record, "record")?;
        let Payload::Record(log) = &mut self.payload else {
            return Err(ProxyError::SessionNotFound(self.id.to_string()));
        };
        let ordinal = log.append(exchange)?;
        self.state = SessionState::Recording;
        Ok(ordinal)
    }

    /// Answers `request` from the recording: the lowest unconsumed matching
    /// interaction is consumed and a transformed copy of its response returned.
    ///
    /// The request is matched after `shared` and then the session's own
    /// sanitizers have run over a copy of it. Transforms see the original.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::NoMatchFound`] with ranked candidates on a miss.
    pub fn play(
        &mut self,
        shared: &[Sanitizer],
        request: &RequestRecord,
    ) -> Result<ResponseRecord, ProxyError> {
        self.ensure_mode(Mode::Playback, "playback")?;
        let sanitized = sanitize::sanitize_request(shared, request);
        let sanitized = sanitize::sanitize_request(&self.sanitizers, &sanitized);
        let Payload::Playback { recording, consumed, cursor } = &mut self.payload else {
            return Err(ProxyError::SessionNotFound(self.id.to_string()));
        };
        self.state = SessionState::Playback;
        let index =
            self.matcher.find_match(&sanitized, &recording.interactions, consumed, *cursor)?;
        consumed[index] = true;
        while consumed.get(*cursor).copied().unwrap_or(false) {
            *cursor += 1;
        }
        let interaction = &recording.interactions[index];
        tracing::debug!(
            session = %self.id,
            ordinal = interaction.ordinal,
            uri = %request.uri,
            "played back"
        );
        Ok(transform::apply_all(&self.transforms, request, &interaction.response))
    }

    fn close(&mut self) -> Payload {
        self.state = SessionState::Stopped;
        std::mem::replace(&mut self.payload, Payload::Closed)
    }
}
