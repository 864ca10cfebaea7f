pub mod history;
pub mod reenable;
pub mod refresh;
pub mod settings;
pub mod status;

use crate::daemon::{DBUS_NAME, DBUS_PATH};
use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use zbus::zvariant::DynamicType;

/// Calls a scheduler method on the running daemon.
async fn call<B, R>(method: &str, body: &B) -> Result<R>
where
    B: Serialize + DynamicType,
    R: DeserializeOwned + zbus::zvariant::Type,
{
    let connection = zbus::Connection::session()
        .await
        .context("Failed to connect to session D-Bus")?;

    let reply: R = connection
        .call_method(Some(DBUS_NAME), DBUS_PATH, Some(DBUS_NAME), method, body)
        .await
        .with_context(|| format!("Failed to call {method} - is the daemon running?"))?
        .body()
        .deserialize()
        .context("Failed to deserialize response")?;

    Ok(reply)
}

/// Calls a method whose reply is a JSON document and decodes it.
async fn call_json<B, T>(method: &str, body: &B) -> Result<T>
where
    B: Serialize + DynamicType,
    T: DeserializeOwned,
{
    let json: String = call(method, body).await?;
    serde_json::from_str(&json).with_context(|| format!("Malformed {method} reply"))
}
