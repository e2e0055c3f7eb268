//! Platform capability traits
//!
//! Screen capture, input injection and user notification are provided by the
//! embedding application, one implementation per platform. The engine only
//! sees these traits.

use crate::error::ResourceError;
use crate::session::{EndReason, Session};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Mouse button
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MouseButton {
    Left,
    Right,
    Middle,
}

/// Remote input forwarded from the controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputEvent {
    MouseMove { x: i32, y: i32 },
    MouseButton { button: MouseButton, pressed: bool },
    Scroll { dx: i32, dy: i32 },
    Key { code: u32, pressed: bool },
    Text { text: String },
}

/// One captured frame
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub width: u32,
    pub height: u32,
    pub data: Bytes,
}

#[async_trait]
pub trait ScreenCapture: Send + Sync {
    async fn capture(&self) -> std::result::Result<CapturedFrame, ResourceError>;
}

#[async_trait]
pub trait InputInjector: Send + Sync {
    async fn inject(&self, event: &InputEvent) -> std::result::Result<(), ResourceError>;
}

/// User-facing notifications about session lifecycle
pub trait Notifier: Send + Sync {
    fn session_started(&self, session: &Session);
    fn session_ended(&self, session: &Session, reason: &EndReason);
}

/// Notifier that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentNotifier;

impl Notifier for SilentNotifier {
    fn session_started(&self, _session: &Session) {}
    fn session_ended(&self, _session: &Session, _reason: &EndReason) {}
}
