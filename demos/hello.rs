use hello_nsq::driver::{self, Settings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let received = driver::run(Settings::default()).await?;
    for body in received {
        println!("{}", String::from_utf8_lossy(&body));
    }
    Ok(())
}
