use arl_sdk::{Arl, StepRequest};

#[tokio::main]
async fn main() -> arl_sdk::Result<()> {
    let client = Arl::builder().build()?;

    let status = client.health().await?;
    println!("Health: {status}");

    let session = client.create_session("base-pool", Default::default()).await?;
    println!("Session: {} (sandbox {})", session.id, session.sandbox_name);

    let result = client
        .execute(session.id, &[StepRequest::new("echo", &["echo", "Hello from ARL!"])])
        .await?;
    for step in &result.results {
        println!("{}: {}", step.name, step.output.stdout.trim_end());
    }

    client.delete_session(session.id).await?;
    Ok(())
}
