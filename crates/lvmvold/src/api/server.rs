use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response as HttpResponse};
use axum::{Json, Router, routing::post};
use lvmvol::VolumeDriver;
use lvmvol::plugin::{ActivateResponse, MountRequest, Request, Response};
use lvmvol_common::{ErrorCategory, VolumeError, VolumeResult};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tower_http::trace::TraceLayer;

/// Content type of plugin protocol responses.
const PLUGIN_MIME: &str = "application/vnd.docker.plugins.v1+json";

type Driver = State<Arc<VolumeDriver>>;

pub fn app(driver: Arc<VolumeDriver>) -> Router {
    Router::new()
        .route("/Plugin.Activate", post(activate))
        .route("/VolumeDriver.Create", post(create))
        .route("/VolumeDriver.Remove", post(remove))
        .route("/VolumeDriver.Mount", post(mount))
        .route("/VolumeDriver.Unmount", post(unmount))
        .route("/VolumeDriver.Path", post(path))
        .route("/VolumeDriver.Get", post(get))
        .route("/VolumeDriver.List", post(list))
        .route("/VolumeDriver.Capabilities", post(capabilities))
        .layer(TraceLayer::new_for_http())
        .with_state(driver)
}

fn reply<T: Serialize>(body: T) -> HttpResponse {
    ([(header::CONTENT_TYPE, PLUGIN_MIME)], Json(body)).into_response()
}

/// Decode a request body. The runtime does not always send a JSON content
/// type, and some calls have an empty body.
fn decode<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, HttpResponse> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| {
        tracing::warn!(error = %e, "Malformed plugin request");
        reply(Response::error(&VolumeError::from(e)))
    })
}

/// Run a driver call on the blocking pool; the driver shells out and holds
/// its lock for the whole call.
async fn blocking<T, F>(call: F) -> VolumeResult<T>
where
    F: FnOnce() -> VolumeResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(call)
        .await
        .unwrap_or_else(|e| {
            Err(VolumeError::Internal {
                message: e.to_string(),
            })
        })
}

fn respond<T>(
    op: &str,
    name: &str,
    result: VolumeResult<T>,
    payload: impl FnOnce(T) -> Response,
) -> HttpResponse {
    if let Err(e) = &result {
        match e.category() {
            ErrorCategory::Validation | ErrorCategory::Dependency => {
                tracing::warn!(op, volume = %name, error = %e, "Request rejected");
            }
            ErrorCategory::External | ErrorCategory::Persistence | ErrorCategory::Internal => {
                tracing::error!(op, volume = %name, error = %e, "Request failed");
            }
        }
    }
    reply(Response::from_result(result, payload))
}

async fn activate() -> HttpResponse {
    tracing::info!("Plugin activated");
    reply(ActivateResponse::default())
}

async fn create(State(driver): Driver, body: Bytes) -> HttpResponse {
    let req: Request = match decode(&body) {
        Ok(req) => req,
        Err(resp) => return resp,
    };
    let name = req.name.clone();
    let result =
        blocking(move || driver.create(&req.name, &req.opts.unwrap_or_default())).await;
    respond("create", &name, result, |_| Response::ok())
}

async fn remove(State(driver): Driver, body: Bytes) -> HttpResponse {
    let req: Request = match decode(&body) {
        Ok(req) => req,
        Err(resp) => return resp,
    };
    let name = req.name.clone();
    let result = blocking(move || driver.remove(&req.name)).await;
    respond("remove", &name, result, |()| Response::ok())
}

async fn mount(State(driver): Driver, body: Bytes) -> HttpResponse {
    let req: MountRequest = match decode(&body) {
        Ok(req) => req,
        Err(resp) => return resp,
    };
    tracing::debug!(volume = %req.name, id = %req.id, "Mount requested");
    let name = req.name.clone();
    let result = blocking(move || driver.mount(&req.name)).await;
    respond("mount", &name, result, |path| Response::mountpoint(&path))
}

async fn unmount(State(driver): Driver, body: Bytes) -> HttpResponse {
    let req: MountRequest = match decode(&body) {
        Ok(req) => req,
        Err(resp) => return resp,
    };
    tracing::debug!(volume = %req.name, id = %req.id, "Unmount requested");
    let name = req.name.clone();
    let result = blocking(move || driver.unmount(&req.name)).await;
    respond("unmount", &name, result, |()| Response::ok())
}

async fn path(State(driver): Driver, body: Bytes) -> HttpResponse {
    let req: Request = match decode(&body) {
        Ok(req) => req,
        Err(resp) => return resp,
    };
    let name = req.name.clone();
    let result = blocking(move || driver.path(&req.name)).await;
    respond("path", &name, result, |path| Response::mountpoint(&path))
}

async fn get(State(driver): Driver, body: Bytes) -> HttpResponse {
    let req: Request = match decode(&body) {
        Ok(req) => req,
        Err(resp) => return resp,
    };
    let name = req.name.clone();
    let result = blocking(move || driver.get(&req.name)).await;
    respond("get", &name, result, Response::volume)
}

async fn list(State(driver): Driver) -> HttpResponse {
    let result = blocking(move || Ok(driver.list())).await;
    respond("list", "", result, Response::volumes)
}

async fn capabilities(State(driver): Driver) -> HttpResponse {
    reply(Response::capabilities(driver.capabilities()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use lvmvol::{DriverConfig, MemoryGateway};
    use serde_json::{Value, json};
    use std::io::Write;

    struct Fixture {
        home: tempfile::TempDir,
        _config: tempfile::NamedTempFile,
        driver: Arc<VolumeDriver>,
    }

    fn fixture() -> Fixture {
        let home = tempfile::tempdir().unwrap();
        let mut config = tempfile::NamedTempFile::new().unwrap();
        writeln!(config, "VOLUME_GROUP=vg0").unwrap();

        let driver_config = DriverConfig::default()
            .with_home(home.path())
            .with_vg_config(config.path());
        let driver =
            VolumeDriver::open(&driver_config, Arc::new(MemoryGateway::new())).unwrap();
        Fixture {
            home,
            _config: config,
            driver: Arc::new(driver),
        }
    }

    async fn body(resp: HttpResponse) -> Value {
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).unwrap(),
            PLUGIN_MIME
        );
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn request(value: &Value) -> Bytes {
        Bytes::from(value.to_string())
    }

    #[tokio::test]
    async fn activation() {
        assert_eq!(
            body(activate().await).await,
            json!({"Implements": ["VolumeDriver"]})
        );
    }

    #[tokio::test]
    async fn volume_round_trip() {
        let f = fixture();
        let state = || State(f.driver.clone());
        let mountpoint = f.home.path().join("v1").display().to_string();

        let resp = create(
            state(),
            request(&json!({"Name": "v1", "Opts": {"size": "20M"}})),
        )
        .await;
        assert_eq!(body(resp).await, json!({}));

        let resp = mount(state(), request(&json!({"Name": "v1", "ID": "c1"}))).await;
        assert_eq!(body(resp).await, json!({"Mountpoint": mountpoint}));

        let resp = path(state(), request(&json!({"Name": "v1"}))).await;
        assert_eq!(body(resp).await, json!({"Mountpoint": mountpoint}));

        let resp = get(state(), request(&json!({"Name": "v1"}))).await;
        let value = body(resp).await;
        assert_eq!(value["Volume"]["Name"], "v1");
        assert_eq!(value["Volume"]["Mountpoint"], mountpoint);
        assert!(value.get("Err").is_none());

        let resp = list(state()).await;
        assert_eq!(body(resp).await["Volumes"].as_array().unwrap().len(), 1);

        let resp = unmount(state(), request(&json!({"Name": "v1", "ID": "c1"}))).await;
        assert_eq!(body(resp).await, json!({}));

        let resp = remove(state(), request(&json!({"Name": "v1"}))).await;
        assert_eq!(body(resp).await, json!({}));

        let resp = list(state()).await;
        assert_eq!(body(resp).await, json!({"Volumes": []}));
    }

    #[tokio::test]
    async fn errors_are_reported_in_err() {
        let f = fixture();
        let state = || State(f.driver.clone());

        let resp = path(state(), request(&json!({"Name": "missing"}))).await;
        assert_eq!(body(resp).await, json!({"Err": "no such volume: missing"}));

        let resp = create(state(), request(&json!({"Name": "v1", "Opts": null}))).await;
        assert_eq!(
            body(resp).await,
            json!({"Err": "Please specify a size with --size"})
        );

        let resp = create(state(), Bytes::from_static(b"{not json")).await;
        assert!(body(resp).await["Err"].is_string());
    }

    #[tokio::test]
    async fn capabilities_and_empty_bodies() {
        let f = fixture();
        let resp = capabilities(State(f.driver.clone())).await;
        assert_eq!(
            body(resp).await,
            json!({"Capabilities": {"Scope": "local"}})
        );

        let resp = get(State(f.driver.clone()), Bytes::new()).await;
        assert!(body(resp).await["Err"].is_string());
    }
}
