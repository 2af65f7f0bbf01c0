//! Protocol states, events, and the transition table.
//!
//! The table is pure data; side effects of entering a state (starting or
//! stopping the step runner) live in [`crate::context`].

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    GetCluster,
    CreateCluster,
    Announce,
    ClearAnnounce,
    Running,
    Stop,
}

impl State {
    pub const ALL: [State; 6] = [
        State::GetCluster,
        State::CreateCluster,
        State::Announce,
        State::ClearAnnounce,
        State::Running,
        State::Stop,
    ];

    /// States processed by the step runner. `Running` is served by the
    /// periodic workers and `Stop` is terminal.
    pub fn is_active(self) -> bool {
        !matches!(self, State::Running | State::Stop)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            State::GetCluster => "GET_CLUSTER",
            State::CreateCluster => "CREATE_CLUSTER",
            State::Announce => "ANNOUNCE",
            State::ClearAnnounce => "CLEAR_ANNOUNCE",
            State::Running => "RUNNING",
            State::Stop => "STOP",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    ClusterDefined,
    ClusterUndefined,
    ClusterCreated,
    Announced,
    AnnounceDuplicated,
    AnnounceRefreshFailedWithKey,
    AnnounceRefreshFailedWithNoKey,
    AnnounceCleared,
    AnnounceLocalInstanceNotFound,
    Reset,
    Stopped,
}

impl Event {
    pub const ALL: [Event; 11] = [
        Event::ClusterDefined,
        Event::ClusterUndefined,
        Event::ClusterCreated,
        Event::Announced,
        Event::AnnounceDuplicated,
        Event::AnnounceRefreshFailedWithKey,
        Event::AnnounceRefreshFailedWithNoKey,
        Event::AnnounceCleared,
        Event::AnnounceLocalInstanceNotFound,
        Event::Reset,
        Event::Stopped,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Event::ClusterDefined => "CLUSTER_DEFINED",
            Event::ClusterUndefined => "CLUSTER_UNDEFINED",
            Event::ClusterCreated => "CLUSTER_CREATED",
            Event::Announced => "ANNOUNCED",
            Event::AnnounceDuplicated => "ANNOUNCE_DUPLICATED",
            Event::AnnounceRefreshFailedWithKey => "ANNOUNCE_REFRESH_FAILED_WITH_KEY",
            Event::AnnounceRefreshFailedWithNoKey => "ANNOUNCE_REFRESH_FAILED_WITH_NO_KEY",
            Event::AnnounceCleared => "ANNOUNCE_CLEARED",
            Event::AnnounceLocalInstanceNotFound => "ANNOUNCE_LOCAL_INSTANCE_NOT_FOUND",
            Event::Reset => "RESET",
            Event::Stopped => "STOPPED",
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Listed transitions. `Stopped` leads to `Stop` from every state and is
/// handled in [`next`]; any other pair not listed here is a self-loop.
pub const TRANSITIONS: &[(State, Event, State)] = &[
    (State::GetCluster, Event::ClusterDefined, State::Announce),
    (State::GetCluster, Event::ClusterUndefined, State::CreateCluster),
    (State::GetCluster, Event::Reset, State::GetCluster),
    (State::CreateCluster, Event::ClusterCreated, State::Announce),
    (State::CreateCluster, Event::Reset, State::GetCluster),
    (State::Announce, Event::Announced, State::Running),
    (State::Announce, Event::AnnounceDuplicated, State::ClearAnnounce),
    (State::Announce, Event::AnnounceLocalInstanceNotFound, State::Announce),
    (State::Announce, Event::Reset, State::GetCluster),
    (State::ClearAnnounce, Event::AnnounceCleared, State::Announce),
    (State::ClearAnnounce, Event::AnnounceLocalInstanceNotFound, State::Announce),
    (State::ClearAnnounce, Event::Reset, State::GetCluster),
    (State::Running, Event::AnnounceRefreshFailedWithKey, State::ClearAnnounce),
    (State::Running, Event::AnnounceRefreshFailedWithNoKey, State::Announce),
    (State::Running, Event::AnnounceLocalInstanceNotFound, State::Announce),
    (State::Running, Event::Reset, State::GetCluster),
];

/// State reached from `state` on `event`.
pub fn next(state: State, event: Event) -> State {
    if event == Event::Stopped {
        return State::Stop;
    }
    TRANSITIONS
        .iter()
        .find(|(from, on, _)| *from == state && *on == event)
        .map(|(_, _, to)| *to)
        .unwrap_or(state)
}
