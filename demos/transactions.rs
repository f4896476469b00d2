use corvid_stomp::{ConnectOptions, Frame, Session};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Expects a STOMP broker on localhost:61613 (e.g. RabbitMQ with the stomp plugin).

    let options = ConnectOptions::new().login("guest").passcode("guest");
    let session = Session::connect_tcp("127.0.0.1:61613", options).await?;

    let tx_id = "tx-example-1";
    session.begin(tx_id).await?;
    println!("Transaction {} started", tx_id);

    for n in 1..=2 {
        let msg = Frame::send("/queue/test", None, format!("message {} in transaction", n))
            .header("transaction", tx_id);
        session.send_frame(msg).await?;
        println!("Sent message {} in transaction", n);
    }

    // Both messages are delivered atomically once the broker acknowledges the commit.
    let commit = session
        .send_frame(Frame::commit(tx_id).receipt("commit-1"))
        .await?;
    commit.wait().await?;
    println!("Transaction {} committed", tx_id);

    let tx_id_2 = "tx-example-2";
    session.begin(tx_id_2).await?;
    println!("\nTransaction {} started", tx_id_2);

    let msg = Frame::send("/queue/test", None, "this message will be aborted")
        .header("transaction", tx_id_2);
    session.send_frame(msg).await?;
    println!("Sent message in transaction {} (will be aborted)", tx_id_2);

    session.abort(tx_id_2).await?;
    println!("Transaction {} aborted", tx_id_2);

    session.disconnect().await?.wait().await?;
    Ok(())
}
