#[rocket::main]
async fn main() -> Result<(), rocket::Error> {
    subscan_api::rocket().launch().await?;
    Ok(())
}
