//! Session state and choke/interest flags

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Handshaking,
    /// Connected, nothing in flight
    Idle,
    /// Connected with transfers in flight
    Active,
}

/// The four protocol booleans, at their connection-start values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerFlags {
    /// We refuse to serve them
    pub am_choking: bool,
    /// We want their pieces
    pub am_interested: bool,
    /// They refuse to serve us
    pub peer_choking: bool,
    /// They want our pieces
    pub peer_interested: bool,
}

impl Default for PeerFlags {
    fn default() -> Self {
        Self {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
        }
    }
}
