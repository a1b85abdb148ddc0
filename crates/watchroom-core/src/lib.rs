pub mod net;
pub mod room;
pub mod time;
pub mod validate;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers {
    use crate::net::messages::{AddToQueueMsg, ClientMessage, JoinRoomMsg};

    /// A syntactically valid 11-character video id derived from `n`.
    pub fn video_id(n: usize) -> String {
        format!("vid{n:08}")
    }

    /// `add_to_queue` payload for the video id produced by [`video_id`].
    pub fn add_video(n: usize) -> AddToQueueMsg {
        AddToQueueMsg {
            video_url: format!("https://www.youtube.com/watch?v={}", video_id(n)),
            title: format!("Video {n}"),
            duration: 180.0,
            thumbnail: format!("https://i.ytimg.com/vi/{}/hqdefault.jpg", video_id(n)),
        }
    }

    /// `join_room` message with a stable user id.
    pub fn join(room_id: &str, username: &str, user_id: &str) -> ClientMessage {
        ClientMessage::JoinRoom(JoinRoomMsg {
            room_id: room_id.to_string(),
            username: username.to_string(),
            user_id: Some(user_id.to_string()),
        })
    }
}
