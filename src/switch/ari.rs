//! REST switch client
//!
//! [`SwitchClient`] over the switch's REST command interface.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{Bridge, Channel, OriginateRequest, SwitchClient, SwitchError};
use crate::config::SwitchConfig;

/// Dialplan context that hands a redirected channel to the application
const CONVERT_TO_APP_CONTEXT: &str = "convert_to_stasis";
const APP_ARGS_VAR: &str = "TRANSFER_STASIS_ARGS";

#[derive(Debug, Deserialize)]
struct VariableResponse {
    value: String,
}

#[derive(Debug, Serialize)]
struct OriginateBody<'a> {
    variables: &'a HashMap<String, String>,
}

pub struct AriClient {
    client: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
    app_name: String,
}

impl AriClient {
    pub fn new(config: &SwitchConfig) -> Result<Self, SwitchError> {
        info!(
            "Initializing switch client for application {} at {}",
            config.app_name, config.base_url
        );

        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| SwitchError::Protocol(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
            app_name: config.app_name.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, SwitchError> {
        let response = request
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;
        Ok(response.error_for_status()?)
    }

    async fn post(&self, path: &str, query: &[(&str, &str)]) -> Result<(), SwitchError> {
        debug!(path, "POST");
        self.send(self.client.post(self.url(path)).query(query))
            .await
            .map(|_| ())
    }

    async fn delete(&self, path: &str, query: &[(&str, &str)]) -> Result<(), SwitchError> {
        debug!(path, "DELETE");
        self.send(self.client.delete(self.url(path)).query(query))
            .await
            .map(|_| ())
    }

    async fn get_json<R>(&self, path: &str, query: &[(&str, &str)]) -> Result<R, SwitchError>
    where
        R: for<'de> Deserialize<'de>,
    {
        let response = self
            .send(self.client.get(self.url(path)).query(query))
            .await?;
        response
            .json()
            .await
            .map_err(|e| SwitchError::Protocol(format!("Failed to parse response: {}", e)))
    }
}

#[async_trait]
impl SwitchClient for AriClient {
    fn application(&self) -> &str {
        &self.app_name
    }

    async fn get_channel(&self, channel_id: &str) -> Result<Channel, SwitchError> {
        self.get_json(&format!("channels/{}", channel_id), &[]).await
    }

    async fn list_channels(&self) -> Result<Vec<Channel>, SwitchError> {
        self.get_json("channels", &[]).await
    }

    async fn get_channel_var(&self, channel_id: &str, name: &str) -> Result<String, SwitchError> {
        let var: VariableResponse = self
            .get_json(
                &format!("channels/{}/variable", channel_id),
                &[("variable", name)],
            )
            .await?;
        Ok(var.value)
    }

    async fn set_channel_var(
        &self,
        channel_id: &str,
        name: &str,
        value: &str,
    ) -> Result<(), SwitchError> {
        self.post(
            &format!("channels/{}/variable", channel_id),
            &[("variable", name), ("value", value)],
        )
        .await
    }

    async fn originate(&self, request: OriginateRequest) -> Result<Channel, SwitchError> {
        let app_args = request.app_args.join(",");
        let timeout = request.timeout.map(|t| t.to_string());
        let mut query = vec![
            ("endpoint", request.endpoint.as_str()),
            ("app", request.app.as_str()),
            ("appArgs", app_args.as_str()),
        ];
        if let Some(ref t) = timeout {
            query.push(("timeout", t.as_str()));
        }

        let response = self
            .send(
                self.client
                    .post(self.url("channels"))
                    .query(&query)
                    .json(&OriginateBody {
                        variables: &request.variables,
                    }),
            )
            .await?;
        response
            .json()
            .await
            .map_err(|e| SwitchError::Protocol(format!("Failed to parse channel: {}", e)))
    }

    async fn hangup(&self, channel_id: &str) -> Result<(), SwitchError> {
        self.delete(&format!("channels/{}", channel_id), &[]).await
    }

    async fn ring(&self, channel_id: &str) -> Result<(), SwitchError> {
        self.post(&format!("channels/{}/ring", channel_id), &[]).await
    }

    async fn stop_ring(&self, channel_id: &str) -> Result<(), SwitchError> {
        self.delete(&format!("channels/{}/ring", channel_id), &[]).await
    }

    async fn hold(&self, channel_id: &str) -> Result<(), SwitchError> {
        self.post(&format!("channels/{}/hold", channel_id), &[]).await
    }

    async fn unhold(&self, channel_id: &str) -> Result<(), SwitchError> {
        self.delete(&format!("channels/{}/hold", channel_id), &[]).await
    }

    async fn start_moh(&self, channel_id: &str, moh_class: &str) -> Result<(), SwitchError> {
        self.post(
            &format!("channels/{}/moh", channel_id),
            &[("mohClass", moh_class)],
        )
        .await
    }

    async fn stop_moh(&self, channel_id: &str) -> Result<(), SwitchError> {
        self.delete(&format!("channels/{}/moh", channel_id), &[]).await
    }

    async fn mute(&self, channel_id: &str) -> Result<(), SwitchError> {
        self.post(
            &format!("channels/{}/mute", channel_id),
            &[("direction", "in")],
        )
        .await
    }

    async fn unmute(&self, channel_id: &str) -> Result<(), SwitchError> {
        self.delete(
            &format!("channels/{}/mute", channel_id),
            &[("direction", "in")],
        )
        .await
    }

    async fn redirect_to_app(
        &self,
        channel_id: &str,
        app_args: &[String],
    ) -> Result<(), SwitchError> {
        // The dialplan reads the arguments back when entering the application
        self.set_channel_var(channel_id, APP_ARGS_VAR, &app_args.join(","))
            .await?;
        self.post(
            &format!("channels/{}/continue", channel_id),
            &[
                ("context", CONVERT_TO_APP_CONTEXT),
                ("extension", self.app_name.as_str()),
                ("priority", "1"),
            ],
        )
        .await
    }

    async fn create_bridge(&self, bridge_id: &str) -> Result<Bridge, SwitchError> {
        let response = self
            .send(
                self.client
                    .post(self.url(&format!("bridges/{}", bridge_id)))
                    .query(&[("type", "mixing"), ("name", "transfer")]),
            )
            .await?;
        response
            .json()
            .await
            .map_err(|e| SwitchError::Protocol(format!("Failed to parse bridge: {}", e)))
    }

    async fn get_bridge(&self, bridge_id: &str) -> Result<Bridge, SwitchError> {
        self.get_json(&format!("bridges/{}", bridge_id), &[]).await
    }

    async fn list_bridges(&self) -> Result<Vec<Bridge>, SwitchError> {
        self.get_json("bridges", &[]).await
    }

    async fn destroy_bridge(&self, bridge_id: &str) -> Result<(), SwitchError> {
        self.delete(&format!("bridges/{}", bridge_id), &[]).await
    }

    async fn add_channel(&self, bridge_id: &str, channel_id: &str) -> Result<(), SwitchError> {
        self.post(
            &format!("bridges/{}/addChannel", bridge_id),
            &[("channel", channel_id)],
        )
        .await
    }

    async fn remove_channel(&self, bridge_id: &str, channel_id: &str) -> Result<(), SwitchError> {
        self.post(
            &format!("bridges/{}/removeChannel", bridge_id),
            &[("channel", channel_id)],
        )
        .await
    }

    async fn extension_exists(&self, context: &str, exten: &str) -> Result<bool, SwitchError> {
        let path = format!("dialplan/{}/extensions/{}", context, exten);
        match self.send(self.client.get(self.url(&path))).await {
            Ok(_) => Ok(true),
            Err(SwitchError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn get_global_var(&self, name: &str) -> Result<Option<String>, SwitchError> {
        let var: VariableResponse = self
            .get_json("asterisk/variable", &[("variable", name)])
            .await?;
        Ok(if var.value.is_empty() {
            None
        } else {
            Some(var.value)
        })
    }

    async fn set_global_var(&self, name: &str, value: &str) -> Result<(), SwitchError> {
        self.post("asterisk/variable", &[("variable", name), ("value", value)])
            .await
    }
}
