pub mod broker;
pub mod config;
pub mod conversation;
pub mod db;
pub mod error;
pub mod groups;
pub mod history;
pub mod models;
pub mod online;
pub mod queue;
pub mod routes;

use std::sync::Arc;

use broker::{Broker, BrokerPool};
use config::ServiceConfig;
use db::Db;
use groups::GroupsModel;
use history::HistoryModel;
use online::OnlineModel;
use queue::MessageQueueEngine;
use rocket_cors::CorsOptions;

pub fn rocket() -> rocket::Rocket<rocket::Build> {
    build_rocket(ServiceConfig::from_env())
}

pub fn rocket_with_db(db_path: &str) -> rocket::Rocket<rocket::Build> {
    let mut config = ServiceConfig::from_env();
    config.database_path = db_path.to_string();
    build_rocket(config)
}

pub fn rocket_with_config(config: ServiceConfig) -> rocket::Rocket<rocket::Build> {
    build_rocket(config)
}

fn build_rocket(config: ServiceConfig) -> rocket::Rocket<rocket::Build> {
    // Ensure data directory exists
    if let Some(parent) = std::path::Path::new(&config.database_path).parent() {
        std::fs::create_dir_all(parent).ok();
    }

    let db = Arc::new(Db::new(&config.database_path));
    let broker = Broker::new();
    let pool = BrokerPool::new(broker, config.broker_max_connections);

    let history = Arc::new(HistoryModel::new(Arc::clone(&db)));
    let groups = Arc::new(GroupsModel::new(
        Arc::clone(&db),
        Arc::clone(&history),
        config.group_cluster_size,
    ));
    let queue = Arc::new(MessageQueueEngine::new(
        Arc::clone(&history),
        pool.get(),
        &config,
    ));
    let online = Arc::new(OnlineModel::new(
        pool,
        Arc::clone(&groups),
        Arc::clone(&history),
        Arc::clone(&queue),
    ));

    let cors = CorsOptions::default()
        .to_cors()
        .expect("Failed to create CORS");

    let engine = Arc::clone(&queue);

    rocket::build()
        .manage(config)
        .manage(history)
        .manage(groups)
        .manage(queue)
        .manage(online)
        .attach(cors)
        .register(
            "/",
            rocket::catchers![routes::not_found, routes::unauthorized],
        )
        .mount(
            "/",
            rocket::routes![
                routes::health,
                routes::send_message,
                routes::send_batch,
                routes::join_group,
                routes::group_inbox,
                routes::get_message,
                routes::update_message,
                routes::delete_message,
                routes::mark_read,
                routes::list_messages,
                routes::listen,
            ],
        )
        .attach(rocket::fairing::AdHoc::on_liftoff(
            "Message Queue Engine",
            move |_rocket| {
                Box::pin(async move {
                    if let Err(e) = engine.start().await {
                        log::error!("Failed to start message consuming queue: {e}");
                    }
                })
            },
        ))
}
