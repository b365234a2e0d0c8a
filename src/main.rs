use gamewatch::app;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    match app::run().await {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("Error: {}", err);
            std::process::exit(1);
        }
    }
}
