//! Doorbell relay client.
//!
//! Listens on the relay's WebSocket for ring messages, or polls a
//! timestamped marker when only a poll URL is configured. Playback does not
//! depend on either; rings only raise the overlay.

use crate::config::DoorbellSettings;
use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

/// Text frame the relay broadcasts on a ring.
const RING_MESSAGE: &str = "doorbell-ring";

/// Events from the doorbell relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DoorbellEvent {
    Connected,
    Disconnected,
    Ring,
}

/// WebSocket connection to the relay, reconnected forever.
pub struct DoorbellRelay {
    ws_url: Url,
    reconnect: Duration,
    event_tx: mpsc::Sender<DoorbellEvent>,
}

impl DoorbellRelay {
    pub fn new(
        ws_url: &str,
        reconnect: Duration,
        event_tx: mpsc::Sender<DoorbellEvent>,
    ) -> Result<Self> {
        let mut url = Url::parse(ws_url).context("Invalid doorbell URL")?;

        // Accept http(s) URLs for the relay host as well.
        let scheme = match url.scheme() {
            "https" => Some("wss"),
            "http" => Some("ws"),
            _ => None,
        };
        if let Some(scheme) = scheme {
            url.set_scheme(scheme)
                .map_err(|_| anyhow::anyhow!("Failed to set WebSocket scheme"))?;
        }

        Ok(Self {
            ws_url: url,
            reconnect,
            event_tx,
        })
    }

    pub async fn run(&self) {
        loop {
            tracing::info!("Connecting to doorbell relay at {}", self.ws_url);

            match self.connect_and_listen().await {
                Ok(()) => tracing::warn!(
                    "Doorbell connection closed, reconnecting in {:?}",
                    self.reconnect
                ),
                Err(e) => tracing::error!(
                    "Doorbell connection error: {:#}, reconnecting in {:?}",
                    e,
                    self.reconnect
                ),
            }

            if self.event_tx.send(DoorbellEvent::Disconnected).await.is_err() {
                return;
            }
            sleep(self.reconnect).await;
        }
    }

    async fn connect_and_listen(&self) -> Result<()> {
        let (ws_stream, _response) = connect_async(self.ws_url.as_str())
            .await
            .context("Failed to connect to WebSocket")?;
        let (mut write, mut read) = ws_stream.split();

        let _ = self.event_tx.send(DoorbellEvent::Connected).await;
        tracing::info!("Doorbell relay connected");

        while let Some(msg) = read.next().await {
            match msg.context("Failed to receive message")? {
                Message::Text(text) if is_ring(&text) => {
                    tracing::info!("Doorbell rang");
                    let _ = self.event_tx.send(DoorbellEvent::Ring).await;
                }
                Message::Text(text) => tracing::debug!("Ignoring relay message: {}", text),
                Message::Ping(data) => {
                    write
                        .send(Message::Pong(data))
                        .await
                        .context("Failed to send pong")?;
                }
                Message::Close(_) => {
                    tracing::info!("WebSocket closed by relay");
                    break;
                }
                _ => {}
            }
        }

        Ok(())
    }
}

fn is_ring(text: &str) -> bool {
    text.trim() == RING_MESSAGE
}

/// Polls a marker that changes on every ring.
pub struct MarkerPoller {
    client: reqwest::Client,
    url: String,
    interval: Duration,
    last: Option<String>,
    event_tx: mpsc::Sender<DoorbellEvent>,
}

impl MarkerPoller {
    pub fn new(
        client: reqwest::Client,
        url: String,
        interval: Duration,
        event_tx: mpsc::Sender<DoorbellEvent>,
    ) -> Self {
        Self {
            client,
            url,
            interval,
            last: None,
            event_tx,
        }
    }

    /// Record a marker value. The first value seen is a baseline, not a ring.
    fn observe(&mut self, marker: String) -> bool {
        let changed = self.last.as_ref().is_some_and(|last| *last != marker);
        self.last = Some(marker);
        changed
    }

    async fn fetch_marker(&self) -> Result<String> {
        let text = self
            .client
            .get(&self.url)
            .send()
            .await
            .context("Failed to reach doorbell marker")?
            .error_for_status()
            .context("Doorbell marker request failed")?
            .text()
            .await
            .context("Failed to read doorbell marker")?;
        Ok(text.trim().to_string())
    }

    pub async fn run(mut self) {
        tracing::info!("Polling doorbell marker at {} every {:?}", self.url, self.interval);
        loop {
            match self.fetch_marker().await {
                Ok(marker) => {
                    if self.observe(marker) {
                        tracing::info!("Doorbell rang");
                        if self.event_tx.send(DoorbellEvent::Ring).await.is_err() {
                            return;
                        }
                    }
                }
                Err(e) => tracing::debug!("Doorbell poll failed: {:#}", e),
            }
            sleep(self.interval).await;
        }
    }
}

/// Visibility of the doorbell overlay.
///
/// A ring while the overlay is up does not extend it.
#[derive(Debug)]
pub struct DoorbellOverlay {
    duration: Duration,
    stream_url: Option<String>,
    visible_until: Option<Instant>,
}

impl DoorbellOverlay {
    pub fn new(duration: Duration, stream_url: Option<String>) -> Self {
        Self {
            duration,
            stream_url,
            visible_until: None,
        }
    }

    pub fn from_settings(settings: &DoorbellSettings) -> Self {
        Self::new(
            Duration::from_secs(settings.overlay_secs),
            settings.stream_url.clone(),
        )
    }

    /// Returns true when the ring raised the overlay.
    pub fn ring(&mut self, now: Instant) -> bool {
        if self.is_visible(now) {
            tracing::debug!("Doorbell already showing, ignoring ring");
            return false;
        }
        self.visible_until = Some(now + self.duration);
        true
    }

    pub fn is_visible(&self, now: Instant) -> bool {
        self.visible_until.is_some_and(|until| now < until)
    }

    /// Camera stream to play, only while the overlay is up.
    pub fn stream(&self, now: Instant) -> Option<&str> {
        self.stream_url
            .as_deref()
            .filter(|_| self.is_visible(now))
    }
}

/// Spawn whichever doorbell listener is configured.
pub fn spawn_doorbell(
    settings: &DoorbellSettings,
    client: reqwest::Client,
) -> Result<Option<mpsc::Receiver<DoorbellEvent>>> {
    let (tx, rx) = mpsc::channel(16);

    if let Some(ws_url) = settings.ws_url.as_deref() {
        let relay = DoorbellRelay::new(ws_url, Duration::from_secs(settings.reconnect_secs), tx)?;
        tokio::spawn(async move { relay.run().await });
    } else if let Some(poll_url) = settings.poll_url.clone() {
        let poller = MarkerPoller::new(
            client,
            poll_url,
            Duration::from_secs(settings.poll_interval_secs.max(1)),
            tx,
        );
        tokio::spawn(poller.run());
    } else {
        tracing::debug!("No doorbell relay configured");
        return Ok(None);
    }

    Ok(Some(rx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn ring_message_matches_exactly() {
        assert!(is_ring("doorbell-ring"));
        assert!(is_ring("doorbell-ring\n"));
        assert!(!is_ring("doorbell"));
        assert!(!is_ring("{\"event\":\"doorbell-ring\"}"));
    }

    #[test]
    fn http_relay_url_becomes_websocket() {
        let (tx, _rx) = mpsc::channel(1);
        let relay =
            DoorbellRelay::new("http://frame.local:3001", Duration::from_secs(5), tx).unwrap();
        assert_eq!(relay.ws_url.scheme(), "ws");
    }

    #[test]
    fn first_marker_is_a_baseline() {
        let (tx, _rx) = mpsc::channel(1);
        let mut poller = MarkerPoller::new(
            reqwest::Client::new(),
            "http://frame.local/doorbell".into(),
            Duration::from_secs(2),
            tx,
        );

        assert!(!poller.observe("1700000000".into()));
        assert!(!poller.observe("1700000000".into()));
        assert!(poller.observe("1700000042".into()));
    }

    #[test]
    fn overlay_ignores_rings_while_visible() {
        let start = Instant::now();
        let mut overlay = DoorbellOverlay::new(Duration::from_secs(30), None);

        assert!(!overlay.is_visible(start));
        assert!(overlay.ring(start));
        assert!(!overlay.ring(start + Duration::from_secs(10)));
        assert!(overlay.is_visible(start + Duration::from_secs(29)));
        assert!(!overlay.is_visible(start + Duration::from_secs(30)));
        assert!(overlay.ring(start + Duration::from_secs(31)));
    }

    #[tokio::test]
    async fn relay_delivers_rings() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(Message::Text("hello".into())).await.unwrap();
            ws.send(Message::Text(RING_MESSAGE.into())).await.unwrap();
            ws.close(None).await.unwrap();
        });

        let (tx, mut rx) = mpsc::channel(8);
        let relay =
            DoorbellRelay::new(&format!("ws://{}", addr), Duration::from_secs(60), tx).unwrap();
        let task = tokio::spawn(async move { relay.run().await });

        assert_eq!(rx.recv().await, Some(DoorbellEvent::Connected));
        assert_eq!(rx.recv().await, Some(DoorbellEvent::Ring));
        assert_eq!(rx.recv().await, Some(DoorbellEvent::Disconnected));
        task.abort();
    }

    #[tokio::test]
    async fn nothing_configured_spawns_nothing() {
        let settings = DoorbellSettings::default();
        assert!(spawn_doorbell(&settings, reqwest::Client::new())
            .unwrap()
            .is_none());
    }
}
