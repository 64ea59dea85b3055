#[rocket::main]
async fn main() -> Result<(), rocket::Error> {
    env_logger::init();
    message_hub::rocket().launch().await?;
    Ok(())
}
