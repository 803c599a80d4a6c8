//! HTTP surface over the booking engine.
//!
//! Handlers are thin: they parse the request, call one engine operation and
//! map `EngineError` onto a status code with a JSON `{"error", "kind"}` body.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{FromRequest, FromRequestParts, MatchedPath, Path, Query, Request, State};
use axum::http::StatusCode;
use axum::http::request::Parts;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, patch, post, put};
use axum::{Json, Router};
use chrono::{NaiveDate, NaiveDateTime};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use ulid::Ulid;

use crate::engine::{BusinessChanges, Engine, EngineError, NewBooking, NewBusiness, NewService, NewTimeOff, TimeOffRange};
use crate::model::*;
use crate::observability::{ENGINE_ERRORS_TOTAL, HTTP_REQUESTS_TOTAL};

type AppState = Arc<Engine>;

// ── Errors ───────────────────────────────────────────────

#[derive(Debug)]
pub struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        ApiError(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::AlreadyExists(_) | EngineError::SlotUnavailable(_) => StatusCode::CONFLICT,
            EngineError::NotCancellable(_) => StatusCode::FORBIDDEN,
            EngineError::Validation(_) => StatusCode::BAD_REQUEST,
            EngineError::LimitExceeded(_) => StatusCode::UNPROCESSABLE_ENTITY,
            EngineError::WalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let kind = self.0.kind();
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        }
        metrics::counter!(ENGINE_ERRORS_TOTAL, "kind" => kind).increment(1);
        let body = serde_json::json!({ "error": self.0.to_string(), "kind": kind });
        (status, Json(body)).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError(EngineError::Validation(rejection.body_text()))
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError(EngineError::Validation(rejection.body_text()))
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        ApiError(EngineError::Validation(rejection.body_text()))
    }
}

// ── Extractors ───────────────────────────────────────────

/// `Json` whose rejections answer with the API error body.
pub struct ApiJson<T>(pub T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned + Send,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        Ok(ApiJson(value))
    }
}

pub struct ApiQuery<T>(pub T);

impl<S, T> FromRequestParts<S> for ApiQuery<T>
where
    T: DeserializeOwned + Send,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Query(value) = Query::<T>::from_request_parts(parts, state).await?;
        Ok(ApiQuery(value))
    }
}

pub struct ApiPath<T>(pub T);

impl<S, T> FromRequestParts<S> for ApiPath<T>
where
    T: DeserializeOwned + Send,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Path(value) = Path::<T>::from_request_parts(parts, state).await?;
        Ok(ApiPath(value))
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;
type Created<T> = Result<(StatusCode, Json<T>), ApiError>;

fn created<T>(value: T) -> Created<T> {
    Ok((StatusCode::CREATED, Json(value)))
}

// ── Request bodies ───────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct NewStaff {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct SetActive {
    pub is_active: bool,
}

#[derive(Debug, Deserialize)]
pub struct SetWindow {
    #[serde(default)]
    pub staff_id: Option<Ulid>,
    pub day_of_week: u8,
    pub start_time: ClockTime,
    pub end_time: ClockTime,
}

/// Either whole days (`all_day` with `start_date`/`end_date`) or a
/// `start`/`end` datetime range.
#[derive(Debug, Deserialize)]
pub struct TimeOffRequest {
    #[serde(default)]
    pub staff_id: Option<Ulid>,
    #[serde(default)]
    pub all_day: bool,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub start: Option<NaiveDateTime>,
    pub end: Option<NaiveDateTime>,
    pub title: Option<String>,
}

impl TryFrom<TimeOffRequest> for NewTimeOff {
    type Error = EngineError;

    fn try_from(req: TimeOffRequest) -> Result<Self, Self::Error> {
        let range = if req.all_day {
            let first = req
                .start_date
                .ok_or_else(|| EngineError::Validation("start_date is required for all-day time off".into()))?;
            TimeOffRange::AllDay {
                first,
                last: req.end_date.unwrap_or(first),
            }
        } else {
            match (req.start, req.end) {
                (Some(start), Some(end)) => TimeOffRange::Between { start, end },
                _ => return Err(EngineError::Validation("start and end are required".into())),
            }
        };
        Ok(NewTimeOff {
            staff_id: req.staff_id,
            range,
            title: req.title,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct BookingRequest {
    pub date: NaiveDate,
    pub start_time: ClockTime,
    #[serde(default)]
    pub staff_id: Option<Ulid>,
    pub customer: Customer,
}

#[derive(Debug, Deserialize)]
pub struct RescheduleRequest {
    pub date: NaiveDate,
    pub start_time: ClockTime,
}

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

// ── Query strings ────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct DayQuery {
    pub date: NaiveDate,
    #[serde(default)]
    pub staff_id: Option<Ulid>,
}

#[derive(Debug, Deserialize)]
pub struct ManageQuery {
    pub email: Option<String>,
    pub reference: Option<String>,
}

// ── Responses ────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct BusinessOverview {
    pub business: Business,
    pub staff: Vec<StaffMember>,
    pub services: Vec<Service>,
    pub windows: Vec<AvailabilityWindow>,
}

#[derive(Debug, Serialize)]
pub struct Openings {
    pub date: NaiveDate,
    pub staff_id: Option<Ulid>,
    pub open: Vec<OpenInterval>,
}

#[derive(Debug, Serialize)]
pub struct OpenInterval {
    pub start_time: ClockTime,
    pub end_time: ClockTime,
}

// ── Handlers: catalog ────────────────────────────────────

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn register_business(State(engine): State<AppState>, ApiJson(req): ApiJson<NewBusiness>) -> Created<Business> {
    created(engine.register_business(req).await?)
}

fn overview(engine: &Engine, business: Business, only_active: bool) -> BusinessOverview {
    let catalog = engine.catalog();
    let mut staff = catalog.staff_of(business.id);
    let mut services = catalog.services_of(business.id);
    let mut windows = catalog.windows_of(business.id);
    if only_active {
        staff.retain(|s| s.is_active);
        services.retain(|s| s.is_active);
        windows.retain(|w| w.is_active);
    }
    BusinessOverview {
        business,
        staff,
        services,
        windows,
    }
}

async fn get_business(State(engine): State<AppState>, ApiPath(id): ApiPath<Ulid>) -> ApiResult<BusinessOverview> {
    let business = engine.catalog().business(id)?;
    Ok(Json(overview(&engine, business, false)))
}

/// Public booking page data: active entries only.
async fn business_by_slug(
    State(engine): State<AppState>,
    ApiPath(slug): ApiPath<String>,
) -> Result<Json<BusinessOverview>, Response> {
    let not_found = || {
        let body = serde_json::json!({ "error": format!("no business with slug {slug:?}"), "kind": "not_found" });
        (StatusCode::NOT_FOUND, Json(body)).into_response()
    };
    let business = engine
        .catalog()
        .business_by_slug(&slug)
        .filter(|b| b.is_active)
        .ok_or_else(not_found)?;
    Ok(Json(overview(&engine, business, true)))
}

async fn update_business(
    State(engine): State<AppState>,
    ApiPath(id): ApiPath<Ulid>,
    ApiJson(changes): ApiJson<BusinessChanges>,
) -> ApiResult<Business> {
    Ok(Json(engine.update_business(id, changes).await?))
}

async fn add_staff(
    State(engine): State<AppState>,
    ApiPath(id): ApiPath<Ulid>,
    ApiJson(req): ApiJson<NewStaff>,
) -> Created<StaffMember> {
    created(engine.add_staff(id, &req.name).await?)
}

async fn set_staff_active(
    State(engine): State<AppState>,
    ApiPath((id, staff_id)): ApiPath<(Ulid, Ulid)>,
    ApiJson(req): ApiJson<SetActive>,
) -> ApiResult<StaffMember> {
    Ok(Json(engine.set_staff_active(id, staff_id, req.is_active).await?))
}

async fn define_service(
    State(engine): State<AppState>,
    ApiPath(id): ApiPath<Ulid>,
    ApiJson(req): ApiJson<NewService>,
) -> Created<Service> {
    created(engine.define_service(id, req).await?)
}

async fn set_service_active(
    State(engine): State<AppState>,
    ApiPath((id, service_id)): ApiPath<(Ulid, Ulid)>,
    ApiJson(req): ApiJson<SetActive>,
) -> ApiResult<Service> {
    Ok(Json(engine.set_service_active(id, service_id, req.is_active).await?))
}

async fn set_window(
    State(engine): State<AppState>,
    ApiPath(id): ApiPath<Ulid>,
    ApiJson(req): ApiJson<SetWindow>,
) -> ApiResult<AvailabilityWindow> {
    let window = engine
        .set_window(id, req.staff_id, req.day_of_week, req.start_time, req.end_time)
        .await?;
    Ok(Json(window))
}

async fn deactivate_window(
    State(engine): State<AppState>,
    ApiPath((id, window_id)): ApiPath<(Ulid, Ulid)>,
) -> ApiResult<AvailabilityWindow> {
    Ok(Json(engine.deactivate_window(id, window_id).await?))
}

async fn add_time_off(
    State(engine): State<AppState>,
    ApiPath(id): ApiPath<Ulid>,
    ApiJson(req): ApiJson<TimeOffRequest>,
) -> Created<TimeOffBlock> {
    created(engine.add_time_off(id, NewTimeOff::try_from(req)?).await?)
}

async fn remove_time_off(
    State(engine): State<AppState>,
    ApiPath((id, time_off_id)): ApiPath<(Ulid, Ulid)>,
) -> Result<StatusCode, ApiError> {
    engine.remove_time_off(id, time_off_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Handlers: availability ───────────────────────────────

async fn slots(
    State(engine): State<AppState>,
    ApiPath((id, service_id)): ApiPath<(Ulid, Ulid)>,
    ApiQuery(q): ApiQuery<DayQuery>,
) -> ApiResult<SlotListing> {
    Ok(Json(engine.slots(id, service_id, q.date, q.staff_id).await?))
}

async fn openings(
    State(engine): State<AppState>,
    ApiPath(id): ApiPath<Ulid>,
    ApiQuery(q): ApiQuery<DayQuery>,
) -> ApiResult<Openings> {
    let spans = engine.open_intervals(id, q.date, q.staff_id).await?;
    let open = spans
        .into_iter()
        .filter_map(|s| {
            Some(OpenInterval {
                start_time: ClockTime::from_minutes(s.start)?,
                end_time: ClockTime::from_minutes(s.end)?,
            })
        })
        .collect();
    Ok(Json(Openings {
        date: q.date,
        staff_id: q.staff_id,
        open,
    }))
}

// ── Handlers: bookings ───────────────────────────────────

async fn create_booking(
    State(engine): State<AppState>,
    ApiPath((id, service_id)): ApiPath<(Ulid, Ulid)>,
    ApiJson(req): ApiJson<BookingRequest>,
) -> Created<Booking> {
    let booking = engine
        .create_booking(NewBooking {
            business_id: id,
            service_id,
            staff_id: req.staff_id,
            date: req.date,
            start_time: req.start_time,
            customer: req.customer,
        })
        .await?;
    created(booking)
}

async fn bookings_on(
    State(engine): State<AppState>,
    ApiPath(id): ApiPath<Ulid>,
    ApiQuery(q): ApiQuery<DayQuery>,
) -> ApiResult<Vec<Booking>> {
    engine.catalog().business(id)?;
    let mut bookings = engine.bookings_on(id, q.date).await;
    if let Some(staff_id) = q.staff_id {
        bookings.retain(|b| b.staff_id == Some(staff_id));
    }
    Ok(Json(bookings))
}

async fn manage_booking(
    State(engine): State<AppState>,
    ApiPath((id, booking_id)): ApiPath<(Ulid, Ulid)>,
    ApiQuery(q): ApiQuery<ManageQuery>,
) -> ApiResult<ManagedBooking> {
    let managed = engine
        .manage_booking(id, booking_id, q.email.as_deref(), q.reference.as_deref())
        .await?;
    Ok(Json(managed))
}

async fn get_booking(State(engine): State<AppState>, ApiPath(id): ApiPath<Ulid>) -> ApiResult<Booking> {
    Ok(Json(engine.get_booking(id).await?))
}

async fn reschedule_booking(
    State(engine): State<AppState>,
    ApiPath(id): ApiPath<Ulid>,
    ApiJson(req): ApiJson<RescheduleRequest>,
) -> ApiResult<Booking> {
    Ok(Json(engine.reschedule_booking(id, req.date, req.start_time).await?))
}

async fn cancel_booking(
    State(engine): State<AppState>,
    ApiPath(id): ApiPath<Ulid>,
    body: Option<Json<CancelRequest>>,
) -> ApiResult<Booking> {
    let reason = body.and_then(|Json(req)| req.reason);
    Ok(Json(engine.cancel_booking(id, reason).await?))
}

async fn payment_confirmed(State(engine): State<AppState>, ApiPath(id): ApiPath<Ulid>) -> ApiResult<Booking> {
    Ok(Json(engine.on_payment_confirmed(id).await?))
}

async fn payment_confirmed_by_reference(
    State(engine): State<AppState>,
    ApiPath(reference): ApiPath<Ulid>,
) -> ApiResult<Booking> {
    Ok(Json(engine.on_payment_confirmed_by_reference(reference).await?))
}

async fn payment_refunded(State(engine): State<AppState>, ApiPath(reference): ApiPath<Ulid>) -> ApiResult<Booking> {
    Ok(Json(engine.on_payment_refunded(reference).await?))
}

// ── Router ───────────────────────────────────────────────

async fn count_requests(req: Request, next: Next) -> Response {
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| "unmatched".to_string(), |p| p.as_str().to_string());
    let response = next.run(req).await;
    metrics::counter!(
        HTTP_REQUESTS_TOTAL,
        "route" => route,
        "status" => response.status().as_u16().to_string()
    )
    .increment(1);
    response
}

pub fn router(engine: Arc<Engine>, request_timeout: Duration) -> Router {
    let catalog = Router::new()
        .route("/businesses", post(register_business))
        .route("/businesses/{id}", get(get_business).patch(update_business))
        .route("/businesses/{id}/staff", post(add_staff))
        .route("/businesses/{id}/staff/{staff_id}", patch(set_staff_active))
        .route("/businesses/{id}/services", post(define_service))
        .route("/businesses/{id}/services/{service_id}", patch(set_service_active))
        .route("/businesses/{id}/availability", put(set_window))
        .route("/businesses/{id}/availability/{window_id}", delete(deactivate_window))
        .route("/businesses/{id}/time-offs", post(add_time_off))
        .route("/businesses/{id}/time-offs/{time_off_id}", delete(remove_time_off))
        .route("/public/{slug}", get(business_by_slug));

    let booking = Router::new()
        .route("/businesses/{id}/services/{service_id}/slots", get(slots))
        .route("/businesses/{id}/openings", get(openings))
        .route("/businesses/{id}/services/{service_id}/bookings", post(create_booking))
        .route("/businesses/{id}/bookings", get(bookings_on))
        .route("/businesses/{id}/bookings/{booking_id}", get(manage_booking))
        .route("/bookings/{id}", get(get_booking))
        .route("/bookings/{id}/reschedule", post(reschedule_booking))
        .route("/bookings/{id}/cancel", post(cancel_booking))
        .route("/bookings/{id}/payment-confirmed", post(payment_confirmed))
        .route("/payments/{reference}/confirmed", post(payment_confirmed_by_reference))
        .route("/payments/{reference}/refunded", post(payment_refunded));

    Router::new()
        .route("/health", get(health))
        .merge(catalog)
        .merge(booking)
        .route_layer(middleware::from_fn(count_requests))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, request_timeout))
        .with_state(engine)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_statuses() {
        let id = Ulid::new();
        let cases = [
            (EngineError::NotFound(id), StatusCode::NOT_FOUND),
            (EngineError::SlotUnavailable(id), StatusCode::CONFLICT),
            (EngineError::AlreadyExists(id), StatusCode::CONFLICT),
            (EngineError::NotCancellable(id), StatusCode::FORBIDDEN),
            (EngineError::Validation("bad".into()), StatusCode::BAD_REQUEST),
            (EngineError::LimitExceeded("too many"), StatusCode::UNPROCESSABLE_ENTITY),
            (EngineError::WalError("disk".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError(err).status(), status);
        }
    }

    #[test]
    fn time_off_request_shapes() {
        let all_day: TimeOffRequest = serde_json::from_value(serde_json::json!({
            "all_day": true,
            "start_date": "2024-06-03",
        }))
        .unwrap();
        let new = NewTimeOff::try_from(all_day).unwrap();
        let day = NaiveDate::from_ymd_opt(2024, 6, 3).unwrap();
        assert_eq!(new.range, TimeOffRange::AllDay { first: day, last: day });

        let partial: TimeOffRequest = serde_json::from_value(serde_json::json!({
            "start": "2024-06-03T12:00:00",
        }))
        .unwrap();
        assert!(matches!(NewTimeOff::try_from(partial), Err(EngineError::Validation(_))));
    }
}
