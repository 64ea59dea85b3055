use rocket::serde::json::Json;

// --- Health ---

#[rocket::get("/health")]
pub fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "message-hub",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

// --- Catchers ---

#[rocket::catch(404)]
pub fn not_found() -> Json<serde_json::Value> {
    Json(serde_json::json!({"error": "Not found"}))
}

#[rocket::catch(401)]
pub fn unauthorized() -> Json<serde_json::Value> {
    Json(serde_json::json!({"error": "Missing caller identity"}))
}
