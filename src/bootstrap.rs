// Copyright 2020 Joyent, Inc.

//! The signed HTTP exchange that precedes a session.
//!
//! Each operation is a single POST to `<base_url>/<segment>/<segment>/..`
//! whose JSON body is signed exactly like a WebSocket payload. The reply
//! carries the same `{"Result": ..} | {"Error": ..}` envelope. Nothing is
//! retried: a non-2xx status or an `Error` member fails the call.

use std::sync::Arc;

use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, USER_AGENT};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_derive::{Deserialize, Serialize};
use slog::{debug, info, o, trace, Drain, Logger};

use crate::client::RpcSession;
use crate::config::Config;
use crate::error::Error;
use crate::player::{Platform, PlayerId};
use crate::protocol::{
    PsyResponse, RequestIdAllocator, Signer, REQUEST_ID_HEADER,
    SIGNATURE_HEADER,
};
use crate::transport::{SessionCredentials, BUILD_ID_HEADER, ENVIRONMENT_HEADER};

pub const AUTH_PLAYER_PATH: &[&str] = &["Auth", "AuthPlayer", "v2"];

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthPlayerRequest {
    #[serde(rename = "Platform")]
    pub platform: Platform,
    #[serde(rename = "PlayerName")]
    pub player_name: String,
    #[serde(rename = "PlayerID")]
    pub player_id: String,
    #[serde(rename = "Language")]
    pub language: String,
    #[serde(rename = "AuthTicket")]
    pub auth_ticket: String,
    #[serde(rename = "BuildRegion")]
    pub build_region: String,
    #[serde(rename = "FeatureSet")]
    pub feature_set: String,
    #[serde(rename = "Device")]
    pub device: String,
    #[serde(rename = "LocalFirstPlayerID")]
    pub local_first_player_id: String,
    #[serde(rename = "bSkipAuth")]
    pub skip_auth: bool,
    #[serde(rename = "bSetAsPrimaryAccount")]
    pub set_as_primary_account: bool,
    #[serde(rename = "EpicAuthTicket")]
    pub epic_auth_ticket: String,
    #[serde(rename = "EpicAccountID")]
    pub epic_account_id: String,
}

impl AuthPlayerRequest {
    fn base(
        config: &Config,
        platform: Platform,
        auth_token: &str,
        player_id: &str,
        account_name: &str,
    ) -> AuthPlayerRequest {
        AuthPlayerRequest {
            platform,
            player_name: account_name.to_string(),
            player_id: player_id.to_string(),
            language: "INT".to_string(),
            auth_ticket: auth_token.to_string(),
            build_region: String::new(),
            feature_set: config.feature_set.clone(),
            device: "PC".to_string(),
            local_first_player_id: String::new(),
            skip_auth: false,
            set_as_primary_account: true,
            epic_auth_ticket: auth_token.to_string(),
            epic_account_id: String::new(),
        }
    }

    /// Authenticates with an Epic Games access token.
    pub fn epic(
        config: &Config,
        auth_token: &str,
        account_id: &str,
        account_name: &str,
    ) -> AuthPlayerRequest {
        let mut request = AuthPlayerRequest::base(
            config,
            Platform::Epic,
            auth_token,
            account_id,
            account_name,
        );
        request.local_first_player_id =
            PlayerId::new(Platform::Epic, account_id).to_string();
        request.epic_account_id = account_id.to_string();
        request
    }

    /// Authenticates with a Steam session ticket linked to an Epic account.
    pub fn steam(
        config: &Config,
        auth_token: &str,
        epic_account_id: &str,
        steam_account_id: &str,
        account_name: &str,
    ) -> AuthPlayerRequest {
        let mut request = AuthPlayerRequest::base(
            config,
            Platform::Steam,
            auth_token,
            steam_account_id,
            account_name,
        );
        request.epic_account_id = epic_account_id.to_string();
        request
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AuthPlayerResponse {
    #[serde(rename = "IsLastChanceAuthBan")]
    pub is_last_chance_auth_ban: bool,
    #[serde(rename = "SessionID")]
    pub session_id: String,
    #[serde(rename = "VerifiedPlayerName")]
    pub verified_player_name: String,
    #[serde(rename = "UseWebSocket")]
    pub use_web_socket: bool,
    #[serde(rename = "PerConURL")]
    pub per_con_url: String,
    #[serde(rename = "PerConURLv2")]
    pub per_con_url_v2: String,
    #[serde(rename = "PsyToken")]
    pub psy_token: String,
    #[serde(rename = "CountryRestrictions")]
    pub country_restrictions: Vec<String>,
}

impl AuthPlayerResponse {
    /// The socket URL to dial, preferring the v2 endpoint.
    pub fn connect_url(&self) -> Option<&str> {
        [&self.per_con_url_v2, &self.per_con_url]
            .into_iter()
            .find(|url| !url.is_empty())
            .map(String::as_str)
    }

    pub fn credentials(&self) -> Result<SessionCredentials, Error> {
        let connect_url = self.connect_url().ok_or(Error::MissingConnectUrl)?;
        Ok(SessionCredentials {
            connect_url: connect_url.to_string(),
            session_id: self.session_id.clone(),
            psy_token: self.psy_token.clone(),
        })
    }
}

/// Signed HTTP client for the bootstrap endpoints.
///
/// The client owns the request id sequence for the authenticated session it
/// opens; the session continues numbering where the HTTP calls left off.
pub struct BootstrapClient {
    http: reqwest::Client,
    config: Config,
    signer: Signer,
    ids: Arc<RequestIdAllocator>,
    log: Logger,
}

impl BootstrapClient {
    pub fn new(config: Config, log: Option<&Logger>) -> Result<BootstrapClient, Error> {
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        let signer = Signer::new(config.signing_key.as_bytes())?;
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()?;
        let ids = Arc::new(RequestIdAllocator::new(config.request_id_prefix.clone()));

        Ok(BootstrapClient {
            http,
            config,
            signer,
            ids,
            log,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn request_ids(&self) -> &Arc<RequestIdAllocator> {
        &self.ids
    }

    /// POSTs `params` to `base_url/path..` and decodes the envelope's result.
    pub async fn post<T, R>(&self, path: &[&str], params: &T) -> Result<R, Error>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            path.join("/")
        );
        let body = serde_json::to_vec(params)?;
        let request_id = self.ids.next_id();

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(FORM_CONTENT_TYPE));
        headers.insert(USER_AGENT, HeaderValue::from_str(&self.config.http_user_agent())?);
        headers.insert(BUILD_ID_HEADER, HeaderValue::from_str(&self.config.build_id)?);
        headers.insert(ENVIRONMENT_HEADER, HeaderValue::from_str(&self.config.environment)?);
        headers.insert(REQUEST_ID_HEADER, HeaderValue::from_str(&request_id)?);
        headers.insert(SIGNATURE_HEADER, HeaderValue::from_str(&self.signer.sign(&body))?);

        debug!(self.log, "sending http request";
               "url" => &url, "request_id" => &request_id);
        trace!(self.log, "http request body";
               "body" => %String::from_utf8_lossy(&body));

        let response = self
            .http
            .post(&url)
            .headers(headers)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            debug!(self.log, "http request failed"; "status" => %status);
            return Err(Error::HttpStatus(status));
        }

        let bytes = response.bytes().await?;
        trace!(self.log, "received http response"; "status" => %status,
               "body" => %String::from_utf8_lossy(&bytes));

        PsyResponse::from_body(&bytes)?.into_result()
    }

    pub async fn auth_player(
        &self,
        request: &AuthPlayerRequest,
    ) -> Result<AuthPlayerResponse, Error> {
        let response: AuthPlayerResponse = self.post(AUTH_PLAYER_PATH, request).await?;
        info!(self.log, "player authenticated";
              "player_id" => &request.player_id,
              "session" => &response.session_id);
        Ok(response)
    }

    /// Authenticates and opens the persistent session in one step.
    pub async fn connect(&self, request: &AuthPlayerRequest) -> Result<RpcSession, Error> {
        let response = self.auth_player(request).await?;
        let credentials = response.credentials()?;
        RpcSession::connect(
            &self.config,
            &credentials,
            Arc::clone(&self.ids),
            Some(&self.log),
        )
        .await
    }
}
