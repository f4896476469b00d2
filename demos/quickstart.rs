use corvid_stomp::{ConnectOptions, Frame, Heartbeat, Session, SubscriptionOptions};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Expects a STOMP broker on localhost:61613 (e.g. RabbitMQ with the stomp plugin).

    let options = ConnectOptions::new()
        .login("guest")
        .passcode("guest")
        .heartbeat(Heartbeat::new(10_000, 10_000));
    let session = Session::connect_tcp("127.0.0.1:61613", options).await?;

    let mut sub = session
        .subscribe_channel("/queue/test", SubscriptionOptions::default())
        .await?;

    // Wait for the broker to confirm the message was accepted.
    let receipt = session
        .send_frame(
            Frame::send("/queue/test", Some("text/plain"), "hello from corvid-stomp")
                .receipt("quickstart-1"),
        )
        .await?
        .wait_timeout(Duration::from_secs(5))
        .await?;
    println!("broker receipt: {:?}", receipt.map(|f| f.to_string()));

    match tokio::time::timeout(Duration::from_secs(5), sub.recv()).await {
        Ok(Some(frame)) => println!("received frame:\n{}", frame),
        Ok(None) => println!("subscription closed, no frames received"),
        Err(_) => println!("timed out waiting for a frame"),
    }

    session.disconnect().await?.wait().await?;
    Ok(())
}
