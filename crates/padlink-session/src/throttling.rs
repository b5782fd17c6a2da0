//! Per-control rate limiting inside a controller's input pipeline.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use padlink_actor::{Middleware, Next};
use padlink_exec::ThrottleConfig;
use padlink_protocol::{ButtonType, GamepadState, InputMessage, JoystickType};
use tokio::time::{self, Instant};
use tracing::{debug, trace};

/// One throttled stream: a single button or joystick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Control {
    Button(ButtonType),
    Joystick(JoystickType),
}

type Pending = (InputMessage, Next<GamepadState, InputMessage>);

/// Throttle state of one control. Shared between the middleware and the
/// flush task of the current cooldown.
#[derive(Default)]
struct Window {
    cooldown_until: Option<Instant>,
    pending: Option<Pending>,
    flushing: bool,
}

impl Window {
    fn is_idle(&self, now: Instant) -> bool {
        !self.flushing && self.cooldown_until.is_none_or(|until| until <= now)
    }
}

fn lock(window: &Mutex<Window>) -> MutexGuard<'_, Window> {
    window.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Middleware that limits each button and each joystick to one message per
/// interval, always forwarding the freshest one.
///
/// The first message of an idle control is forwarded inline, so it keeps
/// its place relative to the messages sent around it. Messages arriving
/// during the cooldown overwrite a single pending slot that is flushed when
/// the window ends; a superseded message is dropped along with its
/// completion. Each control cools down on its own, so a busy thumbstick
/// never delays a button press. Layout, gamepad and name messages pass
/// straight through.
pub struct ThrottlingMiddleware {
    interval: Duration,
    windows: HashMap<Control, Arc<Mutex<Window>>>,
}

impl ThrottlingMiddleware {
    /// A zero interval disables throttling.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            windows: HashMap::new(),
        }
    }

    pub fn from_config(config: ThrottleConfig) -> Self {
        Self::new(config.validated().interval())
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

impl Middleware<GamepadState, InputMessage> for ThrottlingMiddleware {
    fn process(&mut self, _state: &GamepadState, message: InputMessage, next: Next<GamepadState, InputMessage>) {
        let control = match &message {
            InputMessage::Button(m) => Control::Button(m.button),
            InputMessage::Joystick(m) => Control::Joystick(m.joystick),
            _ => return next.forward(message),
        };
        if self.interval.is_zero() {
            return next.forward(message);
        }

        let window = self.windows.entry(control).or_insert_with(|| {
            debug!(?control, "throttle window started");
            Arc::default()
        });
        let now = Instant::now();
        let mut slot = lock(window);
        if slot.is_idle(now) {
            slot.cooldown_until = Some(now + self.interval);
            drop(slot);
            return next.forward(message);
        }

        slot.pending = Some((message, next));
        if !slot.flushing {
            slot.flushing = true;
            tokio::spawn(flush(Arc::clone(window), self.interval));
        }
    }
}

/// Hands the pending message on at the end of each window until a window
/// passes with nothing pending.
async fn flush(window: Arc<Mutex<Window>>, interval: Duration) {
    loop {
        let deadline = lock(&window).cooldown_until;
        if let Some(deadline) = deadline {
            time::sleep_until(deadline).await;
        }

        let mut slot = lock(&window);
        match slot.pending.take() {
            Some((message, next)) => {
                trace!("flushing trailing control message");
                slot.cooldown_until = Some(Instant::now() + interval);
                drop(slot);
                next.forward(message);
            }
            None => {
                slot.flushing = false;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use padlink_actor::Actor;
    use padlink_protocol::{ButtonMessage, GamepadLayout, GamepadLayoutMessage, JoystickMessage};
    use tokio::time;

    use super::*;
    use crate::gamepad_reducer;

    /// An actor whose second stage records every joystick x axis that gets
    /// past the throttle.
    fn throttled_actor(interval_ms: u64) -> (Actor<GamepadState, InputMessage>, Arc<Mutex<Vec<f32>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        let actor = Actor::builder(GamepadState::new(GamepadLayout::Extended), gamepad_reducer)
            .middleware(ThrottlingMiddleware::new(Duration::from_millis(interval_ms)))
            .middleware(move |_: &GamepadState, message: InputMessage, next: Next<GamepadState, InputMessage>| {
                if let InputMessage::Joystick(m) = &message {
                    log.lock().unwrap().push(m.state.x_axis);
                }
                next.forward(message);
            })
            .spawn();
        (actor, seen)
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttling_coalesces_joystick_burst() {
        let (actor, seen) = throttled_actor(10);

        for step in 0..5 {
            let x = step as f32 / 4.0;
            actor
                .send(JoystickMessage::new(JoystickType::LeftThumbstick, x, 0.0).into())
                .unwrap();
        }
        time::sleep(Duration::from_millis(50)).await;

        assert_eq!(*seen.lock().unwrap(), vec![0.0, 1.0]);
        assert_eq!(actor.state().await.unwrap().left_thumbstick.x_axis, 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttling_keeps_controls_independent() {
        let (actor, _) = throttled_actor(10);

        actor
            .send(JoystickMessage::new(JoystickType::Dpad, 1.0, 0.0).into())
            .unwrap();
        actor.send(ButtonMessage::new(ButtonType::A, 1.0).into()).unwrap();
        actor.send(ButtonMessage::new(ButtonType::X, 1.0).into()).unwrap();
        time::sleep(Duration::from_millis(1)).await;

        let state = actor.state().await.unwrap();
        assert_eq!(state.dpad.x_axis, 1.0);
        assert_eq!(state.button_a, 1.0);
        assert_eq!(state.button_x, 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttling_keeps_send_order_for_idle_control() {
        let (actor, _) = throttled_actor(10);

        actor.send(ButtonMessage::new(ButtonType::A, 1.0).into()).unwrap();
        actor.send(GamepadLayoutMessage { layout: GamepadLayout::Micro }.into()).unwrap();
        time::sleep(Duration::from_millis(50)).await;

        let state = actor.state().await.unwrap();
        assert_eq!(state.layout, GamepadLayout::Micro);
        assert_eq!(state.button_a, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttling_flushes_latest_press_after_cooldown() {
        let (actor, _) = throttled_actor(10);

        actor.send(ButtonMessage::new(ButtonType::B, 1.0).into()).unwrap();
        actor.send(ButtonMessage::new(ButtonType::B, 0.5).into()).unwrap();
        actor.send(ButtonMessage::new(ButtonType::B, 0.0).into()).unwrap();
        assert_eq!(actor.state().await.unwrap().button_b, 1.0);

        time::sleep(Duration::from_millis(15)).await;
        assert_eq!(actor.state().await.unwrap().button_b, 0.0);

        // The window closed with nothing pending, so the next press is inline.
        time::sleep(Duration::from_millis(15)).await;
        actor.send(ButtonMessage::new(ButtonType::B, 1.0).into()).unwrap();
        assert_eq!(actor.state().await.unwrap().button_b, 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttling_passes_other_messages_through() {
        let (actor, _) = throttled_actor(10_000);
        let mut replacement = GamepadState::new(GamepadLayout::Micro);
        replacement.button_a = 0.5;

        actor
            .send(padlink_protocol::GamepadMessage::new(replacement).into())
            .unwrap();
        assert_eq!(actor.state().await.unwrap(), replacement);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttling_zero_interval_forwards_everything() {
        let (actor, seen) = throttled_actor(0);
        for step in 0..3 {
            actor
                .send(JoystickMessage::new(JoystickType::LeftThumbstick, step as f32, 0.0).into())
                .unwrap();
        }
        actor.state().await.unwrap();
        assert_eq!(seen.lock().unwrap().len(), 3);
    }
}
