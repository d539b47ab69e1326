//! Session runtime
//!
//! Wires the REST collaborator, the signaling socket, the peer factory and
//! local devices to a [`SessionCoordinator`] running on its own task, and
//! hands back a small command handle.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::api::StudyGroupApi;
use super::coordinator::{
    CoordinatorChannels, Flow, LocalIdentity, SessionCommand, SessionCoordinator, SessionInput,
};
use super::heartbeat::Heartbeat;
use crate::config::AppConfig;
use crate::error::{AppError, Result};
use crate::events::{EventBus, SessionEvent};
use crate::media::MediaDevices;
use crate::signaling::{SignalingClient, TransportEvent};
use crate::webrtc::PeerConnectionFactory;

/// A joined study session
pub struct StudySession {
    group_id: String,
    commands: mpsc::UnboundedSender<SessionCommand>,
    events: Arc<EventBus>,
    task: Option<JoinHandle<()>>,
}

impl StudySession {
    /// Join `group_id` and start the session loop
    ///
    /// Registers with the REST API, opens the microphone muted, connects the
    /// signaling socket and starts the activity heartbeat.
    pub async fn start(
        config: Arc<AppConfig>,
        group_id: &str,
        identity: LocalIdentity,
        devices: Arc<dyn MediaDevices>,
        events: Arc<EventBus>,
    ) -> Result<Self> {
        let api = Arc::new(StudyGroupApi::new(
            &config.server.api_base_url,
            group_id,
            Duration::from_secs(config.server.request_timeout_secs),
        )?);

        api.join_session(&identity.user_id).await?;

        // Every failure from here on must undo the join
        let (url, factory) = match prepare(&config, &api).await {
            Ok(prepared) => prepared,
            Err(e) => {
                warn!("Session setup failed after joining: {}", e);
                if let Err(leave_err) = api.leave_session(&identity.user_id).await {
                    warn!("Failed to leave session: {}", leave_err);
                }
                return Err(e);
            }
        };
        let (client, transport_rx) = SignalingClient::connect(url.clone(), config.signaling.clone());
        let client = Arc::new(client);
        info!("Connecting to signaling at {}", url);

        let user_id = identity.user_id.clone();
        let (mut coordinator, channels) = SessionCoordinator::new(
            identity,
            &config,
            factory,
            devices,
            client.clone(),
            events.clone(),
        );
        coordinator.start_media().await;

        let heartbeat = Heartbeat::start(
            api.clone(),
            Duration::from_secs(config.session.heartbeat_interval_secs),
        );

        let (commands, command_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            run_loop(&mut coordinator, channels, transport_rx, command_rx).await;

            coordinator.shutdown().await;
            client.close().await;
            heartbeat.stop().await;
            if let Err(e) = api.leave_session(&user_id).await {
                warn!("Failed to leave session: {}", e);
            }
            info!("Session ended");
        });

        Ok(Self {
            group_id: group_id.to_string(),
            commands,
            events,
            task: Some(task),
        })
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn command(&self, command: SessionCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| AppError::Internal("session already ended".to_string()))
    }

    /// Wait until the session loop stops on its own (socket gone)
    pub async fn finished(&mut self) {
        if let Some(task) = self.task.as_mut() {
            if let Err(e) = task.await {
                warn!("Session task failed: {}", e);
            }
            self.task = None;
        }
    }

    /// Leave the session and wait for cleanup
    pub async fn leave(mut self) {
        let _ = self.commands.send(SessionCommand::Leave);
        self.finished().await;
    }
}

/// Resolve the signaling URL and build the peer factory
async fn prepare(
    config: &AppConfig,
    api: &StudyGroupApi,
) -> Result<(String, Arc<PeerConnectionFactory>)> {
    let url = match config.server.signaling_url.as_deref().filter(|u| !u.is_empty()) {
        Some(url) => url.to_string(),
        None => api.signaling_url().await?,
    };
    let factory = Arc::new(PeerConnectionFactory::new(&config.webrtc)?);
    Ok((url, factory))
}

/// Feed every input source into the coordinator until asked to stop
///
/// Also returns when the signaling transport has gone for good.
pub async fn run_loop(
    coordinator: &mut SessionCoordinator,
    mut channels: CoordinatorChannels,
    mut transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    mut command_rx: mpsc::UnboundedReceiver<SessionCommand>,
) {
    loop {
        let input = tokio::select! {
            Some(command) = command_rx.recv() => SessionInput::Command(command),
            event = transport_rx.recv() => match event {
                Some(event) => SessionInput::Transport(event),
                None => {
                    debug!("Signaling transport finished");
                    break;
                }
            },
            Some(event) = channels.peer_rx.recv() => SessionInput::Peer(event),
            Some(event) = channels.media_rx.recv() => SessionInput::Media(event),
            Some(speaking) = channels.speaking_rx.recv() => SessionInput::Speaking(speaking),
            else => break,
        };

        if coordinator.dispatch(input).await == Flow::Stop {
            info!("Leaving session");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::SyntheticDevices;
    use crate::signaling::protocol::{RemoteParticipant, ServerMessage, UserId};
    use crate::webrtc::testing::{MockFactory, RecordingSignals};

    fn coordinator() -> (SessionCoordinator, CoordinatorChannels, Arc<MockFactory>) {
        let factory = Arc::new(MockFactory::new("user_1"));
        let (coordinator, channels) = SessionCoordinator::new(
            LocalIdentity {
                user_id: UserId::new("1"),
                user_name: "Ana".to_string(),
            },
            &AppConfig::default(),
            factory.clone(),
            Arc::new(SyntheticDevices::new("user_1")),
            Arc::new(RecordingSignals::new()),
            Arc::new(EventBus::new()),
        );
        (coordinator, channels, factory)
    }

    /// Answer one request per connection with the next body, collecting request lines
    async fn serve_sequence(bodies: Vec<&'static str>) -> (String, tokio::task::JoinHandle<Vec<String>>) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());

        let handle = tokio::spawn(async move {
            let mut lines = vec![];
            for body in bodies {
                let (mut stream, _) = listener.accept().await.unwrap();
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                loop {
                    let n = stream.read(&mut buf).await.unwrap();
                    request.extend_from_slice(&buf[..n]);
                    let text = String::from_utf8_lossy(&request).to_string();
                    if let Some(end) = text.find("\r\n\r\n") {
                        let length = text
                            .lines()
                            .find_map(|l| {
                                l.to_ascii_lowercase()
                                    .strip_prefix("content-length:")
                                    .map(|v| v.trim().parse::<usize>().unwrap())
                            })
                            .unwrap_or(0);
                        if request.len() >= end + 4 + length {
                            break;
                        }
                    }
                    if n == 0 {
                        break;
                    }
                }

                let text = String::from_utf8_lossy(&request).to_string();
                lines.push(text.lines().next().unwrap_or_default().to_string());
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                stream.write_all(response.as_bytes()).await.unwrap();
            }
            lines
        });

        (base, handle)
    }

    #[tokio::test]
    async fn test_setup_failure_after_join_leaves() {
        let (base, server) = serve_sequence(vec![
            r#"{"success":true,"participant_count":1}"#,
            "session info unavailable",
            r#"{"success":true,"message":"left"}"#,
        ])
        .await;

        let mut config = AppConfig::default();
        config.server.api_base_url = base;
        let result = StudySession::start(
            Arc::new(config),
            "g1",
            LocalIdentity {
                user_id: UserId::new("1"),
                user_name: "Ana".to_string(),
            },
            Arc::new(SyntheticDevices::new("user_1")),
            Arc::new(EventBus::new()),
        )
        .await;
        assert!(result.is_err());

        let requests = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(requests.len(), 3);
        assert!(requests[0].starts_with("POST /api/study-groups/g1/join-session"));
        assert!(requests[1].starts_with("GET /api/study-groups/g1/session-info"));
        assert!(requests[2].starts_with("POST /api/study-groups/g1/leave-session"));
    }

    #[tokio::test]
    async fn test_loop_runs_until_leave() {
        let (mut coordinator, channels, factory) = coordinator();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        transport_tx.send(TransportEvent::Opened).unwrap();
        transport_tx
            .send(TransportEvent::Message(ServerMessage::ParticipantsUpdate {
                participants: vec![RemoteParticipant {
                    id: "user_2".to_string(),
                    user_id: UserId::new("2"),
                    name: "Ben".to_string(),
                    muted: true,
                    camera_off: true,
                    is_screen_sharing: false,
                    hand_raised: false,
                }],
                room_info: None,
            }))
            .unwrap();

        let driver = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            command_tx.send(SessionCommand::Leave).unwrap();
        };
        tokio::join!(
            run_loop(&mut coordinator, channels, transport_rx, command_rx),
            driver
        );

        assert_eq!(factory.created_count(), 1);
        assert!(coordinator.peers().contains("user_2"));
    }

    #[tokio::test]
    async fn test_loop_ends_with_transport() {
        let (mut coordinator, channels, _factory) = coordinator();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (_command_tx, command_rx) = mpsc::unbounded_channel();

        transport_tx.send(TransportEvent::Opened).unwrap();
        transport_tx
            .send(TransportEvent::Closed { reason: None })
            .unwrap();
        drop(transport_tx);

        tokio::time::timeout(
            Duration::from_secs(2),
            run_loop(&mut coordinator, channels, transport_rx, command_rx),
        )
        .await
        .unwrap();
        assert!(!coordinator.is_connected());
    }
}
