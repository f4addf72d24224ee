//! HTTP transport against the game server's REST API.

use crate::transport::{GameTransport, TransportError};
use crate::wire::{
    AckResponse, FindMatchRequest, GameEnvelope, MatchStatus, MatchmakingResponse, MoveRequest,
    QueueStatusResponse, ServerSnapshot,
};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

const DEVICE_HEADER: &str = "X-Device-ID";

/// reqwest-backed [`GameTransport`].
#[derive(Debug, Clone)]
pub struct HttpTransport {
    /// Base URL of game server, without trailing slash.
    base_url: String,
    /// HTTP client.
    client: reqwest::Client,
    /// Sent as `X-Device-ID` on every request.
    device_id: Option<String>,
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            TransportError::Protocol(err.to_string())
        } else if let Some(status) = err.status() {
            let code = status.as_u16();
            TransportError::Http {
                status: code,
                message: TransportError::describe_status(code).to_string(),
            }
        } else {
            TransportError::Network(err.to_string())
        }
    }
}

impl HttpTransport {
    /// Creates a transport for `base_url` with a per-request timeout.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Network`] if the HTTP client cannot be built.
    #[instrument(skip_all, fields(base_url = %base_url.as_ref()))]
    pub fn new(
        base_url: impl AsRef<str>,
        device_id: Option<String>,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Network(format!("Failed to build client: {}", e)))?;

        info!("HTTP transport ready");
        Ok(Self {
            base_url: base_url.as_ref().trim_end_matches('/').to_string(),
            client,
            device_id,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn with_device(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.device_id {
            Some(id) => builder.header(DEVICE_HEADER, id),
            None => builder,
        }
    }

    async fn read_json<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, TransportError> {
        let status = response.status();
        if !status.is_success() {
            let code = status.as_u16();
            warn!(status = code, "Non-success response");
            return Err(TransportError::Http {
                status: code,
                message: TransportError::describe_status(code).to_string(),
            });
        }
        let body = response.text().await?;
        debug!(len = body.len(), "Response body received");
        serde_json::from_str(&body).map_err(|e| {
            error!(error = %e, "Failed to decode response");
            TransportError::Protocol(format!("Failed to process server response: {}", e))
        })
    }

    fn unwrap_game(envelope: GameEnvelope) -> Result<ServerSnapshot, TransportError> {
        if envelope.status != "success" {
            return Err(TransportError::Rejected(
                envelope
                    .message
                    .unwrap_or_else(|| "Request failed".to_string()),
            ));
        }
        envelope
            .game
            .or(envelope.game_state)
            .ok_or_else(|| TransportError::Protocol("Missing game state in response".to_string()))
    }

    fn check_ack(ack: AckResponse, what: &str) -> Result<(), TransportError> {
        match ack.status.as_str() {
            "success" | "info" => Ok(()),
            _ => Err(TransportError::Rejected(
                ack.message.unwrap_or_else(|| format!("{} failed", what)),
            )),
        }
    }
}

#[async_trait]
impl GameTransport for HttpTransport {
    #[instrument(skip(self), fields(player_id = %player_id))]
    async fn find_match(
        &self,
        player_id: &str,
        device_id: &str,
    ) -> Result<MatchmakingResponse, TransportError> {
        let body = FindMatchRequest {
            player_id: player_id.to_string(),
        };
        let response = self
            .client
            .post(self.url("/api/games/matchmaking/find"))
            .header(DEVICE_HEADER, device_id)
            .json(&body)
            .send()
            .await?;

        if response.status().as_u16() == 409 {
            info!("Player already queued");
            return Ok(MatchmakingResponse::with_status(MatchStatus::AlreadyInQueue));
        }
        Self::read_json(response).await
    }

    #[instrument(skip(self), fields(player_id = %player_id))]
    async fn cancel_match(&self, player_id: &str) -> Result<(), TransportError> {
        let body = FindMatchRequest {
            player_id: player_id.to_string(),
        };
        let response = self
            .with_device(
                self.client
                    .post(self.url("/api/games/matchmaking/cancel"))
                    .json(&body),
            )
            .send()
            .await?;

        if response.status().as_u16() == 404 {
            debug!("Player was not queued; treating cancel as done");
            return Ok(());
        }
        let ack: AckResponse = Self::read_json(response).await?;
        Self::check_ack(ack, "Cancel")
    }

    #[instrument(skip(self), fields(player_id = %player_id))]
    async fn match_status(&self, player_id: &str) -> Result<MatchmakingResponse, TransportError> {
        let url = self.url(&format!("/api/games/matchmaking/status/{}", player_id));
        let response = self.with_device(self.client.get(url)).send().await?;

        if response.status().as_u16() == 404 {
            return Ok(MatchmakingResponse::with_status(MatchStatus::NotFound));
        }
        Self::read_json(response).await
    }

    #[instrument(skip(self))]
    async fn queue_size(&self) -> Result<u32, TransportError> {
        let response = self
            .with_device(self.client.get(self.url("/api/games/matchmaking/queue-status")))
            .send()
            .await?;
        let status: QueueStatusResponse = Self::read_json(response).await?;
        if status.status != "success" {
            return Err(TransportError::Rejected(
                "Failed to get queue status".to_string(),
            ));
        }
        Ok(status.queue_size)
    }

    #[instrument(skip(self), fields(game_id = %game_id, player_id = %player_id))]
    async fn game_state(
        &self,
        game_id: &str,
        player_id: &str,
    ) -> Result<ServerSnapshot, TransportError> {
        let url = self.url(&format!("/api/games/{}?playerId={}", game_id, player_id));
        let response = self.with_device(self.client.get(url)).send().await?;
        Self::unwrap_game(Self::read_json(response).await?)
    }

    #[instrument(skip(self, request), fields(game_id = %game_id, x = request.board_x, y = request.board_y))]
    async fn make_move(
        &self,
        game_id: &str,
        request: &MoveRequest,
    ) -> Result<ServerSnapshot, TransportError> {
        let url = self.url(&format!("/api/games/{}/moves", game_id));
        let response = self
            .with_device(self.client.post(url).json(request))
            .send()
            .await?;
        Self::unwrap_game(Self::read_json(response).await?)
    }

    #[instrument(skip(self), fields(game_id = %game_id, player_id = %player_id))]
    async fn leave_game(&self, game_id: &str, player_id: &str) -> Result<(), TransportError> {
        let url = self.url(&format!("/api/games/{}/leave?playerId={}", game_id, player_id));
        let response = self.with_device(self.client.post(url)).send().await?;
        let ack: AckResponse = Self::read_json(response).await?;
        Self::check_ack(ack, "Leave")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unwrap_game_prefers_game_key() {
        let envelope: GameEnvelope = serde_json::from_value(serde_json::json!({
            "status": "success",
            "gameState": {"gameId": "alt"},
            "game": {"gameId": "main"}
        }))
        .unwrap();
        let snapshot = HttpTransport::unwrap_game(envelope).unwrap();
        assert_eq!(snapshot.game_id.as_deref(), Some("main"));
    }

    #[test]
    fn test_unwrap_game_reports_server_message() {
        let envelope: GameEnvelope = serde_json::from_value(serde_json::json!({
            "status": "error",
            "message": "Not your turn"
        }))
        .unwrap();
        assert_eq!(
            HttpTransport::unwrap_game(envelope),
            Err(TransportError::Rejected("Not your turn".into()))
        );
    }

    #[test]
    fn test_missing_snapshot_is_protocol_error() {
        let envelope: GameEnvelope =
            serde_json::from_value(serde_json::json!({"status": "success"})).unwrap();
        assert!(matches!(
            HttpTransport::unwrap_game(envelope),
            Err(TransportError::Protocol(_))
        ));
    }

    #[test]
    fn test_ack_accepts_info() {
        let ack = AckResponse {
            status: "info".into(),
            message: None,
        };
        assert!(HttpTransport::check_ack(ack, "Leave").is_ok());
    }

    #[test]
    fn test_base_url_trimmed() {
        let transport =
            HttpTransport::new("http://localhost:8080/", None, Duration::from_secs(1)).unwrap();
        assert_eq!(
            transport.url("/api/games/g1"),
            "http://localhost:8080/api/games/g1"
        );
    }
}
