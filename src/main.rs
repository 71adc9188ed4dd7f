pub mod auth;
pub mod err;
pub mod ident;
pub mod models;
pub mod service;
pub mod store;
pub mod students;

use axum::{routing::get, routing::post, response::IntoResponse, Router, Json};

use std::net::SocketAddr;
use anyhow::Context;
use axum::handler::Handler;
use axum::http::Uri;
use axum::Extension;
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use tower::ServiceBuilder;

use crate::err::{Error, Fine, Maybe, Nothing};
use crate::service::StudentService;
use crate::store::PgStore;

pub type RefStr = &'static str;
pub type Payload<T> = axum::response::Result<Json<Maybe<T>>, Error>;
pub type Service = StudentService<PgStore>;

pub fn proceeds<V>(value: V) -> Payload<V> where V: Serialize {
    Ok(Json(Fine(value)))
}

pub fn breaks<V>(err: Error) -> Payload<V> where V: Serialize {
    Ok(Json(Nothing(err)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let db_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&db_url)
        .await
        .context("could not connect to the database")?;
    store::prepare_schema(&pool).await?;
    let service = StudentService::new(PgStore::new(pool));

    let app = Router::new()
        .route("/account/register", post(auth::register_student))
        .route("/account/login", post(auth::login_student))
        .route("/account/logout", post(auth::drop_session))
        .route("/account/available", get(auth::check_availability))
        .route("/students", get(students::list_students))
        .route("/students/:id", get(students::read_student))
        .route("/students/:id/update", post(students::update_student))
        .route("/students/:id/delete", post(students::delete_student))
        .fallback(err::handler404.into_service())
        .layer(ServiceBuilder::new().layer(Extension(service)));

    let addr = std::env::var("SMS_BIND")
        .unwrap_or_else(|_| "127.0.0.1:3000".to_string())
        .parse::<SocketAddr>()
        .context("SMS_BIND is not a valid socket address")?;
    log::info!("Starting SMS HTTP Server on http://{}", addr);
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;
    Ok(())
}
