/// Notifications delivered to the application, in emission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    ServerConnected,
    ServerDisconnected,
    JoinedRoom,
    ParticipantJoined {
        uuid: String,
        display: String,
    },
    StreamStarted {
        uuid: String,
        display: String,
        instrument: Option<String>,
        has_audio: bool,
        has_video: bool,
    },
    StreamStopped {
        uuid: String,
        display: String,
        instrument: Option<String>,
    },
    ParticipantLeft {
        uuid: String,
        display: String,
    },
}
