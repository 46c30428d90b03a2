//! GOOSE subscriber.
//!
//! A [`GooseSubscriber`] reads raw Ethernet frames from an [`EthernetSocket`] on its own
//! task, keeps the frames carrying its data set reference and hands every accepted
//! message to the installed [`GooseListener`].

pub mod parser;

use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use snafu::{OptionExt as _, Snafu, ensure};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{Instrument as _, debug, info, info_span, instrument, warn};

pub use parser::GooseMessage;

use crate::mms::{SpanTraceWrapper, ber::BerError, value::MmsValue};

/// Size of the receive buffer: a full Ethernet frame with a VLAN tag.
pub const RECEIVE_BUFFER_SIZE: usize = 1518;

/// Source of raw Ethernet frames.
#[async_trait]
pub trait EthernetSocket: Send {
    /// Wait for the next frame and copy it into `buf`. Returns the frame length.
    async fn receive_packet(&mut self, buf: &mut [u8]) -> Result<usize, GooseError>;
}

/// An [`EthernetSocket`] fed through a channel, for tests and for frames captured
/// elsewhere.
#[derive(Debug)]
pub struct ChannelEthernetSocket {
    /// Frames waiting to be received.
    receiver: mpsc::Receiver<Vec<u8>>,
}

impl ChannelEthernetSocket {
    /// Create a socket and the sender feeding it.
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Sender<Vec<u8>>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { receiver }, sender)
    }
}

#[async_trait]
impl EthernetSocket for ChannelEthernetSocket {
    async fn receive_packet(&mut self, buf: &mut [u8]) -> Result<usize, GooseError> {
        let frame = self.receiver.recv().await.context(SocketClosed)?;
        // Frames longer than the buffer are truncated like on a raw socket.
        let length = frame.len().min(buf.len());
        buf[..length].copy_from_slice(&frame[..length]);
        Ok(length)
    }
}

/// Receives the messages accepted by a subscriber.
pub trait GooseListener: Send + Sync {
    /// Called from the receive loop after the subscriber state was updated.
    fn on_message(&self, message: &GooseMessage);
}

impl<F> GooseListener for F
where
    F: Fn(&GooseMessage) + Send + Sync,
{
    fn on_message(&self, message: &GooseMessage) {
        (self)(message);
    }
}

/// Configuration of a subscriber.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GooseSubscriberConfig {
    /// The data set reference the frames must carry, e.g. `simpleIOGenericIO/LLN0$AnalogValues`.
    pub data_set_ref: String,
    /// Name of the network interface the socket is opened on.
    pub interface_id: String,
    /// Only accept frames with this application id.
    pub app_id: Option<u16>,
}

/// Latest state published for the subscribed data set.
#[derive(Debug, Clone)]
struct SubscriberState {
    /// Application id of the last frame.
    app_id: u16,
    /// Control block reference.
    gocb_ref: String,
    /// GOOSE identifier.
    go_id: String,
    /// State number.
    st_num: u32,
    /// Sequence number.
    sq_num: u32,
    /// Time allowed to live in milliseconds.
    time_allowed_to_live: u32,
    /// Configuration revision.
    conf_rev: u32,
    /// Simulation flag.
    simulation: bool,
    /// Needs commissioning flag.
    nds_com: bool,
    /// Time of the last state change.
    timestamp: MmsValue,
    /// The data set values, shaped like the template.
    data_set_values: Vec<MmsValue>,
}

impl SubscriberState {
    /// Take over everything carried by `message`.
    fn apply(&mut self, message: &GooseMessage) {
        self.app_id = message.app_id;
        self.gocb_ref.clone_from(&message.gocb_ref);
        self.go_id.clone_from(&message.go_id);
        self.st_num = message.st_num;
        self.sq_num = message.sq_num;
        self.time_allowed_to_live = message.time_allowed_to_live;
        self.conf_rev = message.conf_rev;
        self.simulation = message.simulation;
        self.nds_com = message.nds_com;
        self.timestamp.clone_from(&message.timestamp);
        self.data_set_values.clone_from(&message.data_set_values);
    }
}

/// State shared with the receive loop.
struct Shared {
    /// The subscribed data set reference.
    data_set_ref: String,
    /// Accepted application id, any if unset.
    app_id_filter: Option<u16>,
    /// Published state.
    state: Mutex<SubscriberState>,
    /// The listener called for every accepted message.
    listener: RwLock<Option<Arc<dyn GooseListener>>>,
}

impl Shared {
    /// Lock the published state.
    fn state(&self) -> MutexGuard<'_, SubscriberState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Parse a frame and publish it if it targets this subscriber.
    fn process_frame(&self, frame: &[u8]) -> bool {
        let parsed = match parser::parse_frame(frame) {
            Ok(parsed) => parsed,
            Err(error) => {
                debug!("Dropping frame: {error}");
                return false;
            }
        };
        if let Some(app_id) = self.app_id_filter
            && app_id != parsed.app_id
        {
            debug!("Ignoring frame with app id {:#06x}", parsed.app_id);
            return false;
        }

        let message = {
            let mut state = self.state();
            let message = match parser::parse_apdu(
                parsed.app_id,
                parsed.apdu,
                &self.data_set_ref,
                &state.data_set_values,
            ) {
                Ok(Some(message)) => message,
                Ok(None) => return false,
                Err(error) => {
                    debug!("Dropping malformed GOOSE message: {error}");
                    return false;
                }
            };
            state.apply(&message);
            message
        };

        let listener = self.listener.read().unwrap_or_else(PoisonError::into_inner).clone();
        if let Some(listener) = listener {
            listener.on_message(&message);
        }
        true
    }
}

/// The running receive loop.
struct Subscription {
    /// Set to true to stop the loop.
    stop: watch::Sender<bool>,
    /// The loop task.
    task: JoinHandle<()>,
}

/// Subscriber for the GOOSE messages of one data set.
pub struct GooseSubscriber {
    /// State shared with the receive loop.
    shared: Arc<Shared>,
    /// The receive loop while subscribed.
    subscription: Option<Subscription>,
}

impl fmt::Debug for GooseSubscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GooseSubscriber")
            .field("data_set_ref", &self.shared.data_set_ref)
            .field("app_id_filter", &self.shared.app_id_filter)
            .field("subscribed", &self.is_subscribed())
            .finish_non_exhaustive()
    }
}

impl Drop for GooseSubscriber {
    fn drop(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.task.abort();
        }
    }
}

impl GooseSubscriber {
    /// Create a subscriber for `data_set_ref`.
    ///
    /// `template` fixes the number and types of the data set values. Published values are
    /// written into it and elements of another type are ignored.
    #[must_use]
    pub fn new(data_set_ref: impl Into<String>, template: Vec<MmsValue>) -> Self {
        Self::with_filter(data_set_ref.into(), None, template)
    }

    /// Create a subscriber from its configuration.
    #[must_use]
    pub fn from_config(config: &GooseSubscriberConfig, template: Vec<MmsValue>) -> Self {
        Self::with_filter(config.data_set_ref.clone(), config.app_id, template)
    }

    /// Build the subscriber.
    fn with_filter(
        data_set_ref: String,
        app_id_filter: Option<u16>,
        template: Vec<MmsValue>,
    ) -> Self {
        let state = SubscriberState {
            app_id: 0,
            gocb_ref: String::new(),
            go_id: String::new(),
            st_num: 0,
            sq_num: 0,
            time_allowed_to_live: 0,
            conf_rev: 0,
            simulation: false,
            nds_com: false,
            timestamp: MmsValue::new_utc_time(0),
            data_set_values: template,
        };
        Self {
            shared: Arc::new(Shared {
                data_set_ref,
                app_id_filter,
                state: Mutex::new(state),
                listener: RwLock::new(None),
            }),
            subscription: None,
        }
    }

    /// Install the listener called for every accepted message.
    pub fn set_listener(&self, listener: Arc<dyn GooseListener>) {
        *self.shared.listener.write().unwrap_or_else(PoisonError::into_inner) = Some(listener);
    }

    /// Start the receive loop on `socket`.
    #[instrument(skip(self, socket), fields(data_set = %self.shared.data_set_ref))]
    pub fn subscribe(&mut self, socket: impl EthernetSocket + 'static) -> Result<(), GooseError> {
        ensure!(!self.is_subscribed(), AlreadySubscribed);
        let (stop, stopped) = watch::channel(false);
        let task = tokio::spawn(
            receive_loop(Arc::clone(&self.shared), Box::new(socket), stopped)
                .instrument(info_span!("goose_subscriber", data_set = %self.shared.data_set_ref)),
        );
        self.subscription = Some(Subscription { stop, task });
        info!("Subscribed");
        Ok(())
    }

    /// Stop the receive loop and wait for it to finish.
    #[instrument(skip(self), fields(data_set = %self.shared.data_set_ref))]
    pub async fn unsubscribe(&mut self) {
        let Some(subscription) = self.subscription.take() else {
            return;
        };
        // The loop may already be gone after a socket error.
        let _ = subscription.stop.send(true);
        if let Err(error) = subscription.task.await {
            warn!("GOOSE receive loop failed: {error}");
        }
        info!("Unsubscribed");
    }

    /// True while the receive loop runs.
    #[must_use]
    pub fn is_subscribed(&self) -> bool {
        self.subscription.as_ref().is_some_and(|subscription| !subscription.task.is_finished())
    }

    /// Process one frame as the receive loop does. Returns true if it was accepted.
    pub fn process_frame(&self, frame: &[u8]) -> bool {
        self.shared.process_frame(frame)
    }

    /// The subscribed data set reference.
    #[must_use]
    pub fn data_set_ref(&self) -> &str {
        &self.shared.data_set_ref
    }

    /// State number of the last accepted message.
    #[must_use]
    pub fn st_num(&self) -> u32 {
        self.shared.state().st_num
    }

    /// Sequence number of the last accepted message.
    #[must_use]
    pub fn sq_num(&self) -> u32 {
        self.shared.state().sq_num
    }

    /// Simulation flag of the last accepted message.
    #[must_use]
    pub fn is_test(&self) -> bool {
        self.shared.state().simulation
    }

    /// Needs commissioning flag of the last accepted message.
    #[must_use]
    pub fn needs_commission(&self) -> bool {
        self.shared.state().nds_com
    }

    /// Time allowed to live in milliseconds.
    #[must_use]
    pub fn time_allowed_to_live(&self) -> u32 {
        self.shared.state().time_allowed_to_live
    }

    /// Time of the last state change in milliseconds since the unix epoch.
    #[must_use]
    pub fn timestamp(&self) -> u64 {
        self.shared.state().timestamp.utc_time_in_ms().unwrap_or_default()
    }

    /// Configuration revision of the last accepted message.
    #[must_use]
    pub fn conf_rev(&self) -> u32 {
        self.shared.state().conf_rev
    }

    /// The current data set values.
    #[must_use]
    pub fn data_set_values(&self) -> Vec<MmsValue> {
        self.shared.state().data_set_values.clone()
    }

    /// Application id of the last accepted message.
    #[must_use]
    pub fn app_id(&self) -> u16 {
        self.shared.state().app_id
    }

    /// Control block reference of the last accepted message.
    #[must_use]
    pub fn gocb_ref(&self) -> String {
        self.shared.state().gocb_ref.clone()
    }

    /// GOOSE identifier of the last accepted message.
    #[must_use]
    pub fn go_id(&self) -> String {
        self.shared.state().go_id.clone()
    }
}

/// Receive frames until stopped or until the socket fails.
async fn receive_loop(
    shared: Arc<Shared>,
    mut socket: Box<dyn EthernetSocket>,
    mut stop: watch::Receiver<bool>,
) {
    let mut buf = vec![0_u8; RECEIVE_BUFFER_SIZE];
    while !*stop.borrow() {
        tokio::select! {
            biased;
            changed = stop.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            received = socket.receive_packet(&mut buf) => match received {
                Ok(length) => {
                    shared.process_frame(&buf[..length]);
                }
                Err(error) => {
                    warn!("Stopping GOOSE receive loop: {error}");
                    break;
                }
            },
        }
    }
    debug!("GOOSE receive loop finished");
}

#[allow(missing_docs)]
/// Errors of the GOOSE subscriber.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub), context(suffix(false)))]
pub enum GooseError {
    #[snafu(display("Frame of {length} bytes is too short"))]
    FrameTooShort {
        length: usize,
        #[snafu(implicit)]
        context: Box<SpanTraceWrapper>,
    },
    #[snafu(display("EtherType {ether_type:#06x} is not GOOSE"))]
    NotGoose {
        ether_type: u16,
        #[snafu(implicit)]
        context: Box<SpanTraceWrapper>,
    },
    #[snafu(display("Frame of {length} bytes does not match the declared length {declared}"))]
    LengthMismatch {
        length: usize,
        declared: usize,
        #[snafu(implicit)]
        context: Box<SpanTraceWrapper>,
    },
    #[snafu(display("Invalid GOOSE APDU: {reason}"))]
    InvalidApdu {
        reason: &'static str,
        #[snafu(implicit)]
        context: Box<SpanTraceWrapper>,
    },
    #[snafu(display("Malformed GOOSE APDU"))]
    Ber {
        source: BerError,
        #[snafu(implicit)]
        context: Box<SpanTraceWrapper>,
    },
    #[snafu(display("The Ethernet socket is closed"))]
    SocketClosed {
        #[snafu(implicit)]
        context: Box<SpanTraceWrapper>,
    },
    #[snafu(display("The subscriber is already subscribed"))]
    AlreadySubscribed {
        #[snafu(implicit)]
        context: Box<SpanTraceWrapper>,
    },
}

impl GooseError {
    /// Get the span trace captured where the error was created.
    #[must_use]
    pub fn get_context(&self) -> &SpanTraceWrapper {
        match self {
            Self::FrameTooShort { context, .. }
            | Self::NotGoose { context, .. }
            | Self::LengthMismatch { context, .. }
            | Self::InvalidApdu { context, .. }
            | Self::Ber { context, .. }
            | Self::SocketClosed { context }
            | Self::AlreadySubscribed { context } => context,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use rust_telemetry::config::OtelConfig;

    use super::{parser::tests::goose_frame, *};
    use crate::mms::value::tag;

    const DATA_SET: &str = "ied1Inverter/LLN0$Events";

    fn template() -> Vec<MmsValue> {
        vec![MmsValue::new_boolean(false), MmsValue::new_i32(0)]
    }

    fn frame(dat_set: &str, st_num: u32, sq_num: u32, value: i64) -> Vec<u8> {
        goose_frame(dat_set, st_num, sq_num, false, |w| {
            w.boolean(tag::BOOLEAN, true).int(tag::INTEGER, value);
        })
    }

    fn counting_listener(subscriber: &GooseSubscriber) -> Arc<AtomicUsize> {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        subscriber.set_listener(Arc::new(move |_: &GooseMessage| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        calls
    }

    #[test]
    fn test_retransmission_is_idempotent() {
        let subscriber = GooseSubscriber::new(DATA_SET, template());
        let calls = counting_listener(&subscriber);

        let frame = frame(DATA_SET, 5, 10, 42);
        assert!(subscriber.process_frame(&frame));
        assert!(subscriber.process_frame(&frame));

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(subscriber.st_num(), 5);
        assert_eq!(subscriber.sq_num(), 10);
        assert_eq!(subscriber.conf_rev(), 3);
        assert_eq!(subscriber.time_allowed_to_live(), 2000);
        assert_eq!(subscriber.app_id(), 0x1000);
        assert_eq!(subscriber.gocb_ref(), "ied1Inverter/LLN0$GO$gcb01");
        assert_eq!(subscriber.go_id(), "events");
        assert!(!subscriber.is_test());
        assert!(!subscriber.needs_commission());
        assert_eq!(subscriber.timestamp(), 0x5f5e_1000 * 1000 + 500);
        assert_eq!(
            subscriber.data_set_values(),
            [MmsValue::new_boolean(true), MmsValue::new_i32(42)]
        );
    }

    #[test]
    fn test_mismatch_leaves_state_untouched() {
        let subscriber = GooseSubscriber::new(DATA_SET, template());
        let calls = counting_listener(&subscriber);

        assert!(!subscriber.process_frame(&frame("ied1Inverter/LLN0$Event", 5, 10, 42)));
        assert!(!subscriber.process_frame(&frame("ied1Inverter/LLN0$Eventz", 5, 10, 42)));
        let mut malformed = frame(DATA_SET, 5, 10, 42);
        malformed.pop();
        assert!(!subscriber.process_frame(&malformed));

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(subscriber.st_num(), 0);
        assert_eq!(subscriber.sq_num(), 0);
        assert_eq!(subscriber.data_set_values(), template());
    }

    #[test]
    fn test_surplus_element_keeps_frame() {
        let subscriber = GooseSubscriber::new("ds", vec![MmsValue::new_boolean(false)]);
        let calls = counting_listener(&subscriber);

        assert!(subscriber.process_frame(&frame("ds", 5, 10, 1)));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(subscriber.st_num(), 5);
        assert_eq!(subscriber.sq_num(), 10);
        assert_eq!(subscriber.data_set_values(), [MmsValue::new_boolean(true)]);
    }

    #[test]
    fn test_app_id_filter() {
        let config = GooseSubscriberConfig {
            data_set_ref: DATA_SET.to_owned(),
            interface_id: "eth0".to_owned(),
            app_id: Some(0x2000),
        };
        let subscriber = GooseSubscriber::from_config(&config, template());
        assert!(!subscriber.process_frame(&frame(DATA_SET, 1, 0, 1)));

        let config = GooseSubscriberConfig { app_id: Some(0x1000), ..config };
        let subscriber = GooseSubscriber::from_config(&config, template());
        assert!(subscriber.process_frame(&frame(DATA_SET, 1, 0, 1)));
    }

    #[test]
    fn test_config_from_json() {
        let config: GooseSubscriberConfig = serde_json::from_str(
            r#"{"data_set_ref": "ied1Inverter/LLN0$Events", "interface_id": "eth0"}"#,
        )
        .unwrap();
        assert_eq!(config.data_set_ref, DATA_SET);
        assert_eq!(config.app_id, None);
    }

    #[tokio::test]
    async fn test_receive_loop() {
        let _g = rust_telemetry::init_otel!(&OtelConfig::for_tests());
        let mut subscriber = GooseSubscriber::new(DATA_SET, template());
        let (messages, mut received) = mpsc::unbounded_channel();
        subscriber.set_listener(Arc::new(move |message: &GooseMessage| {
            let _ = messages.send(message.clone());
        }));

        let (socket, frames) = ChannelEthernetSocket::new(8);
        subscriber.subscribe(socket).unwrap();
        assert!(subscriber.is_subscribed());
        let (second, _) = ChannelEthernetSocket::new(1);
        assert!(matches!(subscriber.subscribe(second), Err(GooseError::AlreadySubscribed { .. })));

        frames.send(frame("other", 1, 0, 1)).await.unwrap();
        frames.send(frame(DATA_SET, 7, 0, 1)).await.unwrap();
        frames.send(frame(DATA_SET, 7, 1, 1)).await.unwrap();

        for sq_num in 0..2 {
            let message = tokio::time::timeout(Duration::from_secs(1), received.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(message.st_num, 7);
            assert_eq!(message.sq_num, sq_num);
        }
        assert_eq!(subscriber.sq_num(), 1);

        subscriber.unsubscribe().await;
        assert!(!subscriber.is_subscribed());
        // Unsubscribing twice is harmless.
        subscriber.unsubscribe().await;
    }

    #[tokio::test]
    async fn test_receive_loop_ends_with_socket() {
        let _g = rust_telemetry::init_otel!(&OtelConfig::for_tests());
        let mut subscriber = GooseSubscriber::new(DATA_SET, template());
        let (socket, frames) = ChannelEthernetSocket::new(1);
        subscriber.subscribe(socket).unwrap();
        drop(frames);

        tokio::time::timeout(Duration::from_secs(1), async {
            while subscriber.is_subscribed() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        subscriber.unsubscribe().await;
    }
}
