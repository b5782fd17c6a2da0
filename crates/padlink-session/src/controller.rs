//! Controllers: a gamepad state actor plus the metadata consumers see.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use padlink_actor::{Actor, ObservableActor, Subscription};
use padlink_exec::{Queue, ThrottleConfig};
use padlink_protocol::{GamepadLayout, GamepadState, InputMessage};
use serde::{Deserialize, Serialize};

use crate::{SessionError, ThrottlingMiddleware};

/// The actor that owns a controller's [`GamepadState`].
pub type InputActor = ObservableActor<GamepadState, InputMessage>;

// ---------------------------------------------------------------------------
// Status and type
// ---------------------------------------------------------------------------

/// Link state of a controller as seen by the consumer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    #[default]
    Connected,
}

/// Where a controller's input comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ControllerType {
    /// A platform gamepad framework.
    Native,
    /// A raw HID device.
    Hid,
    /// A controller published by a peer over the network.
    Remote,
}

impl fmt::Display for ControllerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControllerType::Native => "native",
            ControllerType::Hid => "hid",
            ControllerType::Remote => "remote",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Reducer
// ---------------------------------------------------------------------------

/// Applies one input message to a gamepad state.
///
/// - A layout message switches to a fresh state of the new layout; the same
///   layout leaves the state alone.
/// - Button and joystick messages set one control. `Pause` has no value and
///   is ignored.
/// - A gamepad message replaces the whole state.
/// - Name messages do not touch the state.
pub fn gamepad_reducer(state: &GamepadState, message: &InputMessage) -> GamepadState {
    match message {
        InputMessage::Layout(m) if m.layout != state.layout => GamepadState::new(m.layout),
        InputMessage::Button(m) => {
            let mut next = *state;
            if let Some(slot) = next.button_mut(m.button) {
                *slot = m.value;
            }
            next
        }
        InputMessage::Joystick(m) => {
            let mut next = *state;
            *next.joystick_mut(m.joystick) = m.state;
            next
        }
        InputMessage::Gamepad(m) => m.state,
        InputMessage::Layout(_) | InputMessage::Name(_) => *state,
    }
}

/// Lowest index not present in `used`.
pub fn next_free_index(used: impl IntoIterator<Item = u16>) -> u16 {
    let mut used: Vec<u16> = used.into_iter().collect();
    used.sort_unstable();
    used.dedup();
    let mut candidate = 0u16;
    for index in used {
        if index != candidate {
            break;
        }
        candidate = candidate.saturating_add(1);
    }
    candidate
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Meta {
    name: Option<String>,
    status: ConnectionStatus,
    layout: GamepadLayout,
}

fn lock(meta: &Mutex<Meta>) -> MutexGuard<'_, Meta> {
    meta.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One gamepad, local or remote. Cheap to clone; clones share state.
///
/// The layout reported by [`layout`](Self::layout) follows the input
/// actor's state, updated on the actor's delivery queue.
#[derive(Clone)]
pub struct Controller {
    index: u16,
    controller_type: ControllerType,
    meta: Arc<Mutex<Meta>>,
    input: InputActor,
    _layout_watch: Arc<LayoutWatch>,
}

/// Stops mirroring the layout once the last controller clone is gone.
struct LayoutWatch(Subscription);

impl Drop for LayoutWatch {
    fn drop(&mut self) {
        self.0.unsubscribe();
    }
}

impl Controller {
    /// Starts configuring a controller.
    pub fn builder(index: u16, controller_type: ControllerType) -> ControllerBuilder {
        ControllerBuilder {
            index,
            controller_type,
            layout: GamepadLayout::default(),
            name: None,
            throttle: None,
            delivery: None,
        }
    }

    /// Spawns an unthrottled controller. Must be called inside a Tokio runtime.
    pub fn new(index: u16, controller_type: ControllerType, layout: GamepadLayout) -> Self {
        Self::builder(index, controller_type).layout(layout).spawn()
    }

    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn controller_type(&self) -> ControllerType {
        self.controller_type
    }

    pub fn name(&self) -> Option<String> {
        lock(&self.meta).name.clone()
    }

    pub fn set_name(&self, name: Option<String>) {
        lock(&self.meta).name = name;
    }

    pub fn status(&self) -> ConnectionStatus {
        lock(&self.meta).status
    }

    pub(crate) fn set_status(&self, status: ConnectionStatus) {
        lock(&self.meta).status = status;
    }

    pub fn layout(&self) -> GamepadLayout {
        lock(&self.meta).layout
    }

    /// The input actor, for observing state or sending raw messages.
    pub fn input(&self) -> &InputActor {
        &self.input
    }

    /// Feeds one input message to the controller.
    pub fn send(&self, message: impl Into<InputMessage>) -> Result<(), SessionError> {
        Ok(self.input.send(message.into())?)
    }

    /// The current gamepad state, after every message sent so far has left
    /// the actor's mailbox.
    pub async fn state(&self) -> Result<GamepadState, SessionError> {
        Ok(self.input.state().await?)
    }

    /// Runs `observer` on every state change.
    pub fn observe<F>(&self, observer: F) -> Subscription
    where
        F: Fn(&GamepadState) + Send + Sync + 'static,
    {
        self.input.observe(observer)
    }

    /// Whether two handles refer to the same controller.
    pub fn same(&self, other: &Controller) -> bool {
        Arc::ptr_eq(&self.meta, &other.meta)
    }
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let meta = lock(&self.meta);
        f.debug_struct("Controller")
            .field("index", &self.index)
            .field("type", &self.controller_type)
            .field("name", &meta.name)
            .field("status", &meta.status)
            .field("layout", &meta.layout)
            .finish()
    }
}

/// Configures and spawns a [`Controller`].
pub struct ControllerBuilder {
    index: u16,
    controller_type: ControllerType,
    layout: GamepadLayout,
    name: Option<String>,
    throttle: Option<ThrottleConfig>,
    delivery: Option<Arc<dyn Queue>>,
}

impl ControllerBuilder {
    /// Initial layout. Defaults to [`GamepadLayout::Regular`].
    pub fn layout(mut self, layout: GamepadLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn name(mut self, name: Option<String>) -> Self {
        self.name = name;
        self
    }

    /// Rate-limits button and joystick messages with a
    /// [`ThrottlingMiddleware`].
    pub fn throttle(mut self, config: ThrottleConfig) -> Self {
        self.throttle = Some(config);
        self
    }

    /// Queue that observers run on.
    pub fn delivery(mut self, queue: Arc<dyn Queue>) -> Self {
        self.delivery = Some(queue);
        self
    }

    /// Spawns the input actor. Must be called inside a Tokio runtime.
    pub fn spawn(self) -> Controller {
        let mut builder = Actor::builder(GamepadState::new(self.layout), gamepad_reducer)
            .label(format!("controller-{}", self.index));
        if let Some(config) = self.throttle {
            builder = builder.middleware(ThrottlingMiddleware::from_config(config));
        }
        if let Some(queue) = self.delivery {
            builder = builder.delivery(queue);
        }
        let input = builder.spawn_observable();

        let meta = Arc::new(Mutex::new(Meta {
            name: self.name,
            status: ConnectionStatus::Connected,
            layout: self.layout,
        }));
        let mirror = Arc::clone(&meta);
        let watch = input.observe(move |state: &GamepadState| {
            lock(&mirror).layout = state.layout;
        });

        tracing::debug!(
            index = self.index,
            controller_type = %self.controller_type,
            layout = %self.layout,
            "controller created"
        );
        Controller {
            index: self.index,
            controller_type: self.controller_type,
            meta,
            input,
            _layout_watch: Arc::new(LayoutWatch(watch)),
        }
    }
}

// =========================================================================
// Tests
// =========================================================================
