pub type RoomId = String;
pub type SessionId = String;
pub type ParticipantId = String;
pub type UserId = String;
pub type ConnectionId = String;
pub type RecordingId = String;
