//! Protocol marker profiles.
//!
//! The session core never compares engine output against literal strings.
//! Each engine family carries a [`MarkerProfile`] describing its handshake,
//! the lines that signal readiness or the end of a search, and which commands
//! start a search. Profiles are plain data so configuration can override them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Supported engine families
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineFamily {
    /// UCCI xiangqi engine derived from a Stockfish-style core
    Challenger,
    /// ElephantEye UCCI engine
    Eleeye,
    /// Pikafish, speaks UCI
    Pikafish,
}

impl EngineFamily {
    pub const ALL: [EngineFamily; 3] = [
        EngineFamily::Challenger,
        EngineFamily::Eleeye,
        EngineFamily::Pikafish,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EngineFamily::Challenger => "challenger",
            EngineFamily::Eleeye => "eleeye",
            EngineFamily::Pikafish => "pikafish",
        }
    }

    /// Default marker vocabulary for this family
    pub fn profile(&self) -> MarkerProfile {
        match self {
            EngineFamily::Challenger | EngineFamily::Eleeye => MarkerProfile::ucci(),
            EngineFamily::Pikafish => MarkerProfile::uci(),
        }
    }
}

impl fmt::Display for EngineFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "challenger" => Ok(EngineFamily::Challenger),
            "eleeye" => Ok(EngineFamily::Eleeye),
            "pikafish" => Ok(EngineFamily::Pikafish),
            other => Err(format!("unknown engine family: {}", other)),
        }
    }
}

/// State-relevant meaning of an engine output line
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Marker {
    /// Engine finished initialising or answered `isready`
    Ready,
    /// Engine reported that a search has begun
    ThinkingStarted,
    /// Engine finished a search (`bestmove`, `nobestmove`)
    ThinkingDone,
}

/// Marker vocabulary for one protocol dialect.
///
/// Markers match the first whitespace-separated token of a line exactly, so
/// `bestmove` matches `bestmove e2e4` but not `info string bestmove soon`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerProfile {
    /// Lines written right after the process starts
    #[serde(default)]
    pub handshake: Vec<String>,
    #[serde(default)]
    pub ready_markers: Vec<String>,
    #[serde(default)]
    pub thinking_start_markers: Vec<String>,
    #[serde(default)]
    pub thinking_end_markers: Vec<String>,
    /// Commands whose first token starts a search
    #[serde(default)]
    pub think_commands: Vec<String>,
    /// Polite exit request sent on shutdown
    #[serde(default)]
    pub quit_command: Option<String>,
}

impl MarkerProfile {
    /// UCCI dialect (challenger, eleeye)
    pub fn ucci() -> Self {
        Self {
            handshake: vec!["ucci".to_string()],
            ready_markers: vec!["ucciok".to_string(), "readyok".to_string()],
            thinking_start_markers: Vec::new(),
            thinking_end_markers: vec!["bestmove".to_string(), "nobestmove".to_string()],
            think_commands: vec!["go".to_string()],
            quit_command: Some("quit".to_string()),
        }
    }

    /// UCI dialect (pikafish)
    pub fn uci() -> Self {
        Self {
            handshake: vec!["uci".to_string()],
            ready_markers: vec!["uciok".to_string(), "readyok".to_string()],
            thinking_start_markers: Vec::new(),
            thinking_end_markers: vec!["bestmove".to_string()],
            think_commands: vec!["go".to_string()],
            quit_command: Some("quit".to_string()),
        }
    }

    /// Classify an output line. Readiness wins over the thinking markers.
    pub fn classify(&self, line: &str) -> Option<Marker> {
        let token = first_token(line)?;
        if contains(&self.ready_markers, token) {
            Some(Marker::Ready)
        } else if contains(&self.thinking_end_markers, token) {
            Some(Marker::ThinkingDone)
        } else if contains(&self.thinking_start_markers, token) {
            Some(Marker::ThinkingStarted)
        } else {
            None
        }
    }

    /// Whether sending `command` starts a search
    pub fn is_think_command(&self, command: &str) -> bool {
        first_token(command).is_some_and(|token| contains(&self.think_commands, token))
    }
}

fn first_token(line: &str) -> Option<&str> {
    line.split_whitespace().next()
}

fn contains(markers: &[String], token: &str) -> bool {
    markers.iter().any(|m| m == token)
}
