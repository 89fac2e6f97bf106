//! HTTP management API.
//!
//! Lifecycle contract against the core: the server runs on its own thread
//! with its own runtime, translates each request into a [`FleetRequest`]
//! with a bounded reply, and stops when its thread context is cancelled.
//! The fleet never waits on the server.

use crate::config::process_name::ProcessName;
use crate::event::channel::{pub_sub, EventConsumer, EventPublisher};
use crate::fleet::FleetRequest;
use crate::utils::thread_context::{CancellationMessage, NotStartedThreadContext, StartedThreadContext};
use actix_web::web::{self, Data};
use actix_web::{App, HttpResponse, HttpServer};
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};

pub const SERVER_THREAD_NAME: &str = "api_server";

const STARTUP_TIMEOUT: Duration = Duration::from_secs(30);
const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("could not bind the management API to `{addr}`: {reason}")]
    Bind { addr: String, reason: String },

    #[error("the management API did not start within {0:?}")]
    StartupTimeout(Duration),

    #[error("the management API thread went away during startup")]
    StartupChannelClosed,
}

#[derive(Clone)]
struct ApiContext {
    requests: EventPublisher<FleetRequest>,
}

/// Starts the API server thread and waits until the bind outcome is known.
pub fn spawn_api_server(
    addr: String,
    requests: EventPublisher<FleetRequest>,
) -> Result<StartedThreadContext, ServerError> {
    let (startup_publisher, startup_consumer) = pub_sub::<Result<(), ServerError>>();

    let bind_addr = addr.clone();
    let callback = move |stop_consumer: EventConsumer<CancellationMessage>| {
        let context = ApiContext { requests };
        let system = actix_web::rt::System::new();
        system.block_on(async move {
            let server = HttpServer::new(move || {
                App::new()
                    .app_data(Data::new(context.clone()))
                    .route("/healthz", web::get().to(healthz))
                    .route("/status", web::get().to(get_status))
                    .route("/processes/{name}/restart", web::post().to(restart_process))
                    .route("/processes/{name}/stop", web::post().to(stop_process))
                    .route("/processes/{name}/start", web::post().to(start_process))
                    .route("/processes/{name}/scale", web::post().to(scale_process))
                    .route("/processes/{name}/logs", web::get().to(get_logs))
            })
            .workers(2)
            .disable_signals()
            .bind(&bind_addr);

            let server = match server {
                Ok(server) => server.run(),
                Err(err) => {
                    let _ = startup_publisher.publish(Err(ServerError::Bind {
                        addr: bind_addr.clone(),
                        reason: err.to_string(),
                    }));
                    return;
                }
            };

            info!(addr = %bind_addr, "management API listening");
            let _ = startup_publisher.publish(Ok(()));

            let handle = server.handle();
            let stopper = actix_web::rt::spawn(async move {
                let _ = tokio::task::spawn_blocking(move || {
                    let _ = stop_consumer.as_ref().recv();
                })
                .await;
                handle.stop(true).await;
            });

            if let Err(err) = server.await {
                error!(%err, "management API server failed");
            }
            stopper.abort();
        });
    };

    let thread_context = NotStartedThreadContext::new(SERVER_THREAD_NAME, callback).start();

    match startup_consumer.as_ref().recv_timeout(STARTUP_TIMEOUT) {
        Ok(Ok(())) => Ok(thread_context),
        Ok(Err(err)) => Err(err),
        Err(crossbeam::channel::RecvTimeoutError::Timeout) => {
            Err(ServerError::StartupTimeout(STARTUP_TIMEOUT))
        }
        Err(crossbeam::channel::RecvTimeoutError::Disconnected) => {
            Err(ServerError::StartupChannelClosed)
        }
    }
}

async fn healthz() -> HttpResponse {
    HttpResponse::Ok().body("ok")
}

async fn get_status(context: Data<ApiContext>) -> HttpResponse {
    let requests = context.requests.clone();
    let reply = web::block(move || {
        let (reply_publisher, reply_consumer) = pub_sub();
        requests
            .publish(FleetRequest::Status {
                reply: reply_publisher,
            })
            .map_err(|err| err.to_string())?;
        reply_consumer
            .as_ref()
            .recv_timeout(REPLY_TIMEOUT)
            .map_err(|err| err.to_string())
    })
    .await;

    match reply {
        Ok(Ok(status)) => HttpResponse::Ok().json(status),
        Ok(Err(reason)) => HttpResponse::ServiceUnavailable().body(reason),
        Err(err) => HttpResponse::ServiceUnavailable().body(err.to_string()),
    }
}

async fn restart_process(context: Data<ApiContext>, path: web::Path<String>) -> HttpResponse {
    control(context, path.into_inner(), |name, reply| FleetRequest::Restart { name, reply }).await
}

async fn stop_process(context: Data<ApiContext>, path: web::Path<String>) -> HttpResponse {
    control(context, path.into_inner(), |name, reply| FleetRequest::Stop { name, reply }).await
}

async fn start_process(context: Data<ApiContext>, path: web::Path<String>) -> HttpResponse {
    control(context, path.into_inner(), |name, reply| FleetRequest::Start { name, reply }).await
}

#[derive(serde::Deserialize)]
struct ScaleBody {
    scale: usize,
}

#[derive(serde::Deserialize)]
struct LogsQuery {
    #[serde(default = "default_log_tail")]
    tail: usize,
    #[serde(default)]
    follow: bool,
}

fn default_log_tail() -> usize {
    crate::fleet::DEFAULT_LOG_TAIL
}

/// Recent output lines of one process, oldest first, as a JSON array.
/// `follow` is not served here: the live stream is the supervisor's
/// structured log; polling `tail` covers the API contract.
async fn get_logs(
    context: Data<ApiContext>,
    path: web::Path<String>,
    query: web::Query<LogsQuery>,
) -> HttpResponse {
    if query.follow {
        return HttpResponse::NotImplemented()
            .body("follow is served by the structured log stream; poll tail instead");
    }

    let raw_name = path.into_inner();
    let Ok(name) = ProcessName::new(&raw_name) else {
        return HttpResponse::BadRequest().body(format!("invalid process name `{raw_name}`"));
    };

    let requests = context.requests.clone();
    let tail = query.tail;
    let reply = web::block(move || {
        let (reply_publisher, reply_consumer) = pub_sub();
        requests
            .publish(FleetRequest::Logs {
                name,
                tail,
                reply: reply_publisher,
            })
            .map_err(|err| err.to_string())?;
        reply_consumer
            .as_ref()
            .recv_timeout(REPLY_TIMEOUT)
            .map_err(|err| err.to_string())
    })
    .await;

    match reply {
        Ok(Ok(Ok(lines))) => HttpResponse::Ok().json(lines),
        Ok(Ok(Err(reason))) => HttpResponse::NotFound().body(reason),
        Ok(Err(reason)) => HttpResponse::ServiceUnavailable().body(reason),
        Err(err) => HttpResponse::ServiceUnavailable().body(err.to_string()),
    }
}

async fn scale_process(
    context: Data<ApiContext>,
    path: web::Path<String>,
    body: web::Json<ScaleBody>,
) -> HttpResponse {
    let desired = body.scale;
    control(context, path.into_inner(), move |name, reply| FleetRequest::Scale {
        name,
        desired,
        reply,
    })
    .await
}

async fn control<B>(context: Data<ApiContext>, raw_name: String, build: B) -> HttpResponse
where
    B: FnOnce(ProcessName, EventPublisher<Result<(), String>>) -> FleetRequest + Send + 'static,
{
    let Ok(name) = ProcessName::new(&raw_name) else {
        return HttpResponse::BadRequest().body(format!("invalid process name `{raw_name}`"));
    };

    let requests = context.requests.clone();
    let reply = web::block(move || {
        let (reply_publisher, reply_consumer) = pub_sub();
        requests
            .publish(build(name, reply_publisher))
            .map_err(|err| err.to_string())?;
        reply_consumer
            .as_ref()
            .recv_timeout(REPLY_TIMEOUT)
            .map_err(|err| err.to_string())
    })
    .await;

    match reply {
        Ok(Ok(Ok(()))) => HttpResponse::Ok().body("ok"),
        Ok(Ok(Err(reason))) => HttpResponse::Conflict().body(reason),
        Ok(Err(reason)) => HttpResponse::ServiceUnavailable().body(reason),
        Err(err) => HttpResponse::ServiceUnavailable().body(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::status::FleetStatus;
    use crate::utils::threads::spawn_named_thread;
    use std::net::TcpListener;

    /// A stand-in fleet loop answering requests the way the real one does.
    fn fake_fleet() -> EventPublisher<FleetRequest> {
        let (publisher, consumer) = pub_sub::<FleetRequest>();
        spawn_named_thread("fake-fleet", move || {
            while let Ok(request) = consumer.as_ref().recv() {
                match request {
                    FleetRequest::Status { reply } => {
                        let _ = reply.publish(FleetStatus::default());
                    }
                    FleetRequest::Restart { name, reply } => {
                        let result = if name.get() == "web" {
                            Ok(())
                        } else {
                            Err(format!("no process named `{name}`"))
                        };
                        let _ = reply.publish(result);
                    }
                    FleetRequest::Logs { name, reply, .. } => {
                        let result = if name.get() == "web" {
                            Ok(vec!["[0/out] ready".to_string()])
                        } else {
                            Err(format!("no process named `{name}`"))
                        };
                        let _ = reply.publish(result);
                    }
                    FleetRequest::Stop { reply, .. }
                    | FleetRequest::Start { reply, .. }
                    | FleetRequest::Scale { reply, .. } => {
                        let _ = reply.publish(Ok(()));
                    }
                }
            }
        });
        publisher
    }

    fn free_addr() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        addr
    }

    #[test]
    fn status_and_control_round_trips() {
        let addr = free_addr();
        let server = spawn_api_server(addr.clone(), fake_fleet()).unwrap();

        let client = reqwest::blocking::Client::new();

        let health = client
            .get(format!("http://{addr}/healthz"))
            .send()
            .unwrap();
        assert!(health.status().is_success());

        let status = client.get(format!("http://{addr}/status")).send().unwrap();
        assert!(status.status().is_success());
        let body: serde_json::Value = status.json().unwrap();
        assert!(body.get("processes").is_some());

        let restart = client
            .post(format!("http://{addr}/processes/web/restart"))
            .send()
            .unwrap();
        assert!(restart.status().is_success());

        let missing = client
            .post(format!("http://{addr}/processes/ghost/restart"))
            .send()
            .unwrap();
        assert_eq!(missing.status().as_u16(), 409);

        let invalid = client
            .post(format!("http://{addr}/processes/not%20a%20name/restart"))
            .send()
            .unwrap();
        assert_eq!(invalid.status().as_u16(), 400);

        let scale = client
            .post(format!("http://{addr}/processes/web/scale"))
            .json(&serde_json::json!({ "scale": 3 }))
            .send()
            .unwrap();
        assert!(scale.status().is_success());

        let logs = client
            .get(format!("http://{addr}/processes/web/logs?tail=50"))
            .send()
            .unwrap();
        assert!(logs.status().is_success());
        let lines: Vec<String> = logs.json().unwrap();
        assert_eq!(lines, vec!["[0/out] ready"]);

        let follow = client
            .get(format!("http://{addr}/processes/web/logs?follow=true"))
            .send()
            .unwrap();
        assert_eq!(follow.status().as_u16(), 501);

        let missing_logs = client
            .get(format!("http://{addr}/processes/ghost/logs"))
            .send()
            .unwrap();
        assert_eq!(missing_logs.status().as_u16(), 404);

        server.stop_blocking().unwrap();
    }

    #[test]
    fn bind_failure_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let taken = listener.local_addr().unwrap().to_string();

        let result = spawn_api_server(taken, fake_fleet());
        assert!(matches!(result, Err(ServerError::Bind { .. })));
    }
}
