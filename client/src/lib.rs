pub mod capture;
pub mod config;
pub mod login;
pub mod sync;
pub mod ws;

use crate::capture::{FileFrameSource, FrameSource};
use crate::config::Config;
use crate::login::{LoginClient, RequestError};
use crate::sync::SyncClient;
use crate::ws::ControlStreamError;

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("incorrect password")]
    LoginRejected,
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error(transparent)]
    ControlStream(#[from] ControlStreamError),
    #[error("not connected")]
    Disconnected,
    #[error(transparent)]
    Config(#[from] anyhow::Error),
}

/// Log in and open the connection. The returned client heartbeats and
/// publishes until logged out.
#[tracing::instrument(skip_all, fields(username = %config.username))]
pub async fn connect(config: &Config) -> Result<SyncClient, ClientError> {
    let sync_config = config.sync_config()?;
    let api = LoginClient::new(config.api_endpoint.clone())?;
    if !api.login(&config.username, &config.password).await? {
        return Err(ClientError::LoginRejected);
    }
    tracing::info!("logged in");
    let ctl = ws::connect(&config.ws_endpoint, &config.username).await?;
    let source = config
        .frame
        .as_ref()
        .map(|path| Box::new(FileFrameSource::new(path)) as Box<dyn FrameSource>);
    let (out, inc, transport) = ctl.into_parts();
    Ok(
        SyncClient::start(config.username.clone(), out, inc, source, sync_config)
            .with_transport(transport),
    )
}
