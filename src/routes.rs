use log::warn;
use std::sync::Arc;

use actix_web::{HttpRequest, HttpResponse, Responder, guard, http::Method, web};
use actix_ws::{Message, MessageStream, Session};
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use crate::error::AppError;
use crate::events::GpioEvent;
use crate::gpio::{GpioBackend, GpioManager};

pub struct AppState<B: GpioBackend> {
    pub manager: Arc<GpioManager<B>>,
}

impl<B: GpioBackend> Clone for AppState<B> {
    fn clone(&self) -> Self {
        Self {
            manager: Arc::clone(&self.manager),
        }
    }
}

#[derive(Deserialize, Default)]
struct EventsQuery {
    limit: Option<usize>,
}

#[derive(Deserialize, Default)]
struct UsageQuery {
    usage: Option<String>,
}

#[derive(Deserialize, Default)]
struct OwnerQuery {
    owner: Option<String>,
}

async fn handle_event_websocket(
    mut session: Session,
    mut client_stream: MessageStream,
    rx: broadcast::Receiver<GpioEvent>,
    device_filter: Option<String>,
) {
    let mut events = BroadcastStream::new(rx);

    loop {
        tokio::select! {
            msg = client_stream.recv() => {
                let Some(msg) = msg else { break; };

                match msg {
                    Ok(Message::Ping(bytes)) => {
                        let _ = session.pong(&bytes).await;
                    }
                    Ok(Message::Close(reason)) => {
                        let _ = session.close(reason).await;
                        break;
                    }
                    Ok(Message::Text(_))
                    | Ok(Message::Binary(_))
                    | Ok(Message::Pong(_))
                    | Ok(Message::Continuation(_))
                    | Ok(Message::Nop) => {}
                    Err(_) => break,
                }
            }
            event = events.next() => {
                let Some(event) = event else { break; };

                match event {
                    Ok(event) => {
                        if device_filter.as_ref().map(|d| *d == event.device_id).unwrap_or(true) {
                            if let Ok(text) = serde_json::to_string(&event) {
                                if session.text(text).await.is_err() {
                                    warn!("WebSocket client disconnected");
                                    break;
                                }
                            }
                        }
                    }
                    Err(BroadcastStreamRecvError::Lagged(n)) => {
                        let lagged = AppError::CommandError(format!("Event stream lagged by {n} messages"));
                        if session.text(lagged.to_string()).await.is_err() {
                            warn!("WebSocket client lagged and disconnected");
                            break;
                        }
                    }
                }
            }
        }
    }
}

fn resource(path: &str, methods: &[Method]) -> actix_web::Resource {
    web::resource(path).route(
        web::route()
            .guard(guard_not_methods(methods))
            .to(method_not_allowed),
    )
}

impl<B: GpioBackend + 'static> AppState<B> {
    pub fn api_scope(&self, base_path: &str) -> actix_web::Scope {
        web::scope(base_path)
            .service(resource("/config", &[Method::GET]).route(web::get().to(module_config::<B>)))
            .service(resource("/pins", &[Method::GET]).route(web::get().to(pins_usage::<B>)))
            .service(
                resource("/gpios", &[Method::GET, Method::POST])
                    .route(web::get().to(list_devices::<B>))
                    .route(web::post().to(add_gpio::<B>)),
            )
            .service(
                resource("/gpios/raspi", &[Method::GET]).route(web::get().to(raspi_gpios::<B>)),
            )
            .service(
                resource("/gpios/assigned", &[Method::GET])
                    .route(web::get().to(assigned_gpios::<B>)),
            )
            .service(
                resource("/gpios/reserved", &[Method::GET])
                    .route(web::get().to(reserved_gpios::<B>)),
            )
            .service(
                resource("/gpios/reserve", &[Method::POST])
                    .route(web::post().to(reserve_gpio::<B>)),
            )
            .service(
                resource("/gpios/reset", &[Method::POST]).route(web::post().to(reset_gpios::<B>)),
            )
            .service(
                resource("/gpios/events", &[Method::GET]).route(web::get().to(events_ws_all::<B>)),
            )
            .service(
                resource("/gpio/{uuid}", &[Method::GET, Method::POST, Method::DELETE])
                    .route(web::get().to(get_device::<B>))
                    .route(web::post().to(update_gpio::<B>))
                    .route(web::delete().to(delete_gpio::<B>)),
            )
            .service(
                resource("/gpio/{uuid}/on", &[Method::GET, Method::POST])
                    .route(web::get().to(is_on::<B>))
                    .route(web::post().to(turn_on::<B>)),
            )
            .service(
                resource("/gpio/{uuid}/off", &[Method::POST]).route(web::post().to(turn_off::<B>)),
            )
            .service(
                resource("/gpio/{uuid}/event", &[Method::GET])
                    .route(web::get().to(get_last_event::<B>)),
            )
            .service(
                resource("/gpio/{uuid}/events", &[Method::GET])
                    .route(web::get().to(get_events::<B>)),
            )
            .service(
                resource("/gpio/{uuid}/watch", &[Method::GET])
                    .route(web::get().to(events_ws_device::<B>)),
            )
            .service(resource("/raw/{gpio}", &[Method::GET]).route(web::get().to(raw_level::<B>)))
    }
}

async fn module_config<B: GpioBackend + 'static>(
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    Ok(web::Json(state.manager.get_module_config()))
}

async fn pins_usage<B: GpioBackend + 'static>(
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    Ok(web::Json(state.manager.get_pins_usage()))
}

async fn list_devices<B: GpioBackend + 'static>(
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    Ok(web::Json(state.manager.get_module_devices()))
}

async fn raspi_gpios<B: GpioBackend + 'static>(
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    Ok(web::Json(state.manager.get_raspi_gpios()))
}

async fn assigned_gpios<B: GpioBackend + 'static>(
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    Ok(web::Json(state.manager.get_assigned_gpios()))
}

async fn reserved_gpios<B: GpioBackend + 'static>(
    query: web::Query<UsageQuery>,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let devices = state.manager.get_reserved_gpios(query.usage.as_deref())?;

    Ok(web::Json(devices))
}

async fn reserve_gpio<B: GpioBackend + 'static>(
    body: web::Bytes,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let payload = parse_object_payload(&body)?;
    let name = owned_str_param(&payload, "name")?;
    let gpio = owned_str_param(&payload, "gpio")?;
    let usage = owned_str_param(&payload, "usage")?;
    let owner = owner_param(&payload)?.to_string();

    let manager = state.manager.clone();
    let device = blocking(move || {
        manager.reserve_gpio(name.as_deref(), gpio.as_deref(), usage.as_deref(), &owner)
    })
    .await?;

    Ok(web::Json(device))
}

async fn add_gpio<B: GpioBackend + 'static>(
    body: web::Bytes,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let payload = parse_object_payload(&body)?;
    let name = owned_str_param(&payload, "name")?;
    let gpio = owned_str_param(&payload, "gpio")?;
    let mode = owned_str_param(&payload, "mode")?;
    let keep = bool_param(&payload, "keep")?;
    let inverted = bool_param(&payload, "inverted")?;
    let owner = owner_param(&payload)?.to_string();

    let manager = state.manager.clone();
    let device = blocking(move || {
        manager.add_gpio(
            name.as_deref(),
            gpio.as_deref(),
            mode.as_deref(),
            keep,
            inverted,
            &owner,
        )
    })
    .await?;

    Ok(web::Json(device))
}

async fn reset_gpios<B: GpioBackend + 'static>(
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let manager = state.manager.clone();
    blocking(move || {
        manager.reset_gpios();
        Ok(())
    })
    .await?;

    Ok(HttpResponse::Ok())
}

async fn get_device<B: GpioBackend + 'static>(
    req: HttpRequest,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let uuid = parse_uuid(&req)?;

    Ok(web::Json(state.manager.get_device(uuid)?))
}

async fn update_gpio<B: GpioBackend + 'static>(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let uuid = parse_uuid(&req)?.to_string();
    let payload = parse_object_payload(&body)?;
    let name = owned_str_param(&payload, "name")?;
    let keep = bool_param(&payload, "keep")?;
    let inverted = bool_param(&payload, "inverted")?;
    let owner = owner_param(&payload)?.to_string();

    let manager = state.manager.clone();
    let device = blocking(move || {
        manager.update_gpio(Some(&uuid), name.as_deref(), keep, inverted, &owner)
    })
    .await?;

    Ok(web::Json(device))
}

async fn delete_gpio<B: GpioBackend + 'static>(
    req: HttpRequest,
    query: web::Query<OwnerQuery>,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let uuid = parse_uuid(&req)?.to_string();
    let owner = query
        .into_inner()
        .owner
        .ok_or_else(|| AppError::MissingParameter("owner".into()))?;

    let manager = state.manager.clone();
    let deleted = blocking(move || manager.delete_gpio(Some(&uuid), &owner)).await?;

    Ok(web::Json(deleted))
}

async fn is_on<B: GpioBackend + 'static>(
    req: HttpRequest,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let uuid = parse_uuid(&req)?;

    Ok(web::Json(state.manager.is_on(uuid)?))
}

async fn turn_on<B: GpioBackend + 'static>(
    req: HttpRequest,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let uuid = parse_uuid(&req)?.to_string();
    let manager = state.manager.clone();
    blocking(move || manager.turn_on(&uuid)).await?;

    Ok(HttpResponse::Ok())
}

async fn turn_off<B: GpioBackend + 'static>(
    req: HttpRequest,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let uuid = parse_uuid(&req)?.to_string();
    let manager = state.manager.clone();
    blocking(move || manager.turn_off(&uuid)).await?;

    Ok(HttpResponse::Ok())
}

async fn get_last_event<B: GpioBackend + 'static>(
    req: HttpRequest,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let uuid = parse_uuid(&req)?;

    let last = state.manager.get_last_event(uuid)?;

    match last {
        Some(event) => Ok(HttpResponse::Ok().json(event)),
        None => Ok(HttpResponse::Ok().finish()),
    }
}

async fn get_events<B: GpioBackend + 'static>(
    req: HttpRequest,
    query: web::Query<EventsQuery>,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let uuid = parse_uuid(&req)?;

    let events = state.manager.get_events(uuid, query.limit)?;

    Ok(web::Json(events))
}

async fn raw_level<B: GpioBackend + 'static>(
    req: HttpRequest,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let gpio = req
        .match_info()
        .get("gpio")
        .ok_or_else(|| AppError::MissingParameter("gpio".into()))?;

    Ok(web::Json(state.manager.is_gpio_on(gpio)?))
}

async fn events_ws_all<B: GpioBackend + 'static>(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState<B>>,
) -> Result<HttpResponse, AppError> {
    open_event_websocket(&req, stream, &state, None)
}

async fn events_ws_device<B: GpioBackend + 'static>(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState<B>>,
) -> Result<HttpResponse, AppError> {
    let uuid = parse_uuid(&req)?;
    state.manager.get_device(uuid)?;

    open_event_websocket(&req, stream, &state, Some(uuid.to_string()))
}

fn open_event_websocket<B: GpioBackend + 'static>(
    req: &HttpRequest,
    stream: web::Payload,
    state: &AppState<B>,
    device_filter: Option<String>,
) -> Result<HttpResponse, AppError> {
    let rx = state.manager.subscribe_events();
    let (response, session, client_stream) = actix_ws::handle(req, stream)
        .map_err(|e| AppError::CommandError(format!("Websocket error: {e}")))?;

    actix_web::rt::spawn(async move {
        handle_event_websocket(session, client_stream, rx, device_filter).await;
    });

    Ok(response)
}

/// Runs manager work that may join watcher threads or write the device file
/// on the blocking pool.
async fn blocking<T, F>(f: F) -> Result<T, AppError>
where
    F: FnOnce() -> Result<T, AppError> + Send + 'static,
    T: Send + 'static,
{
    web::block(f)
        .await
        .map_err(|e| AppError::CommandError(format!("Blocking task failed: {e}")))?
}

fn parse_uuid(req: &HttpRequest) -> Result<&str, AppError> {
    req.match_info()
        .get("uuid")
        .ok_or_else(|| AppError::MissingParameter("device_uuid".into()))
}

fn parse_object_payload(body: &[u8]) -> Result<Map<String, Value>, AppError> {
    if body.is_empty() {
        return Err(AppError::InvalidParameter("Empty payload".into()));
    }

    match serde_json::from_slice(body) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(AppError::InvalidParameter(
            "Payload must be a json object".into(),
        )),
        Err(e) => Err(AppError::InvalidParameter(format!("Invalid payload: {e}"))),
    }
}

fn str_param<'a>(payload: &'a Map<String, Value>, name: &str) -> Result<Option<&'a str>, AppError> {
    match payload.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) => Ok(Some(value)),
        Some(other) => Err(AppError::invalid_value(name, &other.to_string())),
    }
}

fn owned_str_param(payload: &Map<String, Value>, name: &str) -> Result<Option<String>, AppError> {
    Ok(str_param(payload, name)?.map(str::to_string))
}

fn bool_param(payload: &Map<String, Value>, name: &str) -> Result<Option<bool>, AppError> {
    match payload.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(value)) => Ok(Some(*value)),
        Some(_) => Err(AppError::invalid_type(name, "bool")),
    }
}

fn owner_param(payload: &Map<String, Value>) -> Result<&str, AppError> {
    str_param(payload, "owner")?.ok_or_else(|| AppError::MissingParameter("owner".into()))
}

async fn method_not_allowed() -> HttpResponse {
    HttpResponse::MethodNotAllowed().finish()
}

fn guard_not_methods(methods: &[Method]) -> impl guard::Guard + use<> {
    let allowed: Vec<Method> = methods.to_vec();
    guard::fn_guard(move |ctx| !allowed.iter().any(|m| m == ctx.head().method))
}
