use std::sync::Arc;
use std::time::Duration;

use emerald_beans::broker::Broker;
use emerald_beans::config::BrokerConfig;
use emerald_beans::line_reader::LineReader;
use emerald_beans::transport::{handle_conn, run_sweeper};
use tokio::io::{
    duplex, split, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf,
};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;

struct Client {
    reader: LineReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
    task: JoinHandle<anyhow::Result<()>>,
}

impl Client {
    fn connect(broker: &Arc<Broker>) -> Self {
        let (ours, theirs) = duplex(64 * 1024);
        let (r, w) = split(theirs);
        let task = tokio::spawn(handle_conn(
            broker.clone(),
            r,
            w,
            CancellationToken::new(),
        ));

        let (reader, writer) = split(ours);
        Self {
            reader: reader.into(),
            writer,
            task,
        }
    }

    async fn send(&mut self, data: &[u8]) {
        self.writer.write_all(data).await.unwrap();
    }

    async fn line(&mut self) -> String {
        let line = self.reader.read_line().await.unwrap().expect("a line");
        String::from_utf8(line.to_vec()).unwrap()
    }

    /// Reads a payload of `n` bytes and its CRLF.
    async fn payload(&mut self, n: usize) -> Vec<u8> {
        let data = self.reader.read_exact_bytes(n + 2).await.unwrap().unwrap();
        assert!(data.ends_with(b"\r\n"));
        data[..n].to_vec()
    }

    async fn call(&mut self, line: &str) -> String {
        self.send(format!("{line}\r\n").as_bytes()).await;
        self.line().await
    }

    /// Asserts nothing arrives for a while.
    async fn silent(&mut self) {
        let waited =
            timeout(Duration::from_millis(200), self.reader.read_line()).await;
        assert!(waited.is_err(), "unexpected reply");
    }
}

fn start(config: BrokerConfig) -> Arc<Broker> {
    let broker = Arc::new(Broker::new(config));
    tokio::spawn(run_sweeper(
        broker.clone(),
        Duration::from_millis(10),
        CancellationToken::new(),
    ));
    broker
}

#[tokio::test(start_paused = true)]
async fn test_put_reserve_delete() {
    let broker = start(BrokerConfig::default());
    let mut producer = Client::connect(&broker);
    let mut worker = Client::connect(&broker);

    assert_eq!(producer.call("use jobs").await, "USING jobs");
    producer.send(b"put 5 0 60 5\r\nhello\r\n").await;
    assert_eq!(producer.line().await, "INSERTED 1");

    assert_eq!(worker.call("watch jobs").await, "WATCHING 2");
    assert_eq!(worker.call("reserve").await, "RESERVED 1 5");
    assert_eq!(worker.payload(5).await, b"hello");

    assert_eq!(producer.call("peek 1").await, "FOUND 1 5");
    assert_eq!(producer.payload(5).await, b"hello");

    assert_eq!(worker.call("delete 1").await, "DELETED");
    assert_eq!(producer.call("peek 1").await, "NOT_FOUND");
}

#[tokio::test(start_paused = true)]
async fn test_pipelined_commands_wait_for_reserve() {
    let broker = start(BrokerConfig::default());
    let mut producer = Client::connect(&broker);
    let mut worker = Client::connect(&broker);

    worker.send(b"reserve\r\nlist-tube-used\r\n").await;
    worker.silent().await;

    producer.send(b"put 0 0 10 2\r\nhi\r\n").await;
    assert_eq!(producer.line().await, "INSERTED 1");

    assert_eq!(worker.line().await, "RESERVED 1 2");
    assert_eq!(worker.payload(2).await, b"hi");
    assert_eq!(worker.line().await, "USING default");
}

#[tokio::test(start_paused = true)]
async fn test_reserve_with_timeout_expires() {
    let broker = start(BrokerConfig::default());
    let mut worker = Client::connect(&broker);

    let started = Instant::now();
    assert_eq!(worker.call("reserve-with-timeout 1").await, "TIMED_OUT");
    assert!(started.elapsed() >= Duration::from_secs(1));

    assert_eq!(worker.call("reserve-with-timeout 0").await, "TIMED_OUT");
}

#[tokio::test(start_paused = true)]
async fn test_job_returns_after_ttr() {
    let broker = start(BrokerConfig::default());
    let mut first = Client::connect(&broker);
    let mut second = Client::connect(&broker);

    first.send(b"put 0 0 1 2\r\nhi\r\n").await;
    assert_eq!(first.line().await, "INSERTED 1");
    assert_eq!(first.call("reserve").await, "RESERVED 1 2");
    assert_eq!(first.payload(2).await, b"hi");

    let started = Instant::now();
    assert_eq!(second.call("reserve").await, "RESERVED 1 2");
    assert_eq!(second.payload(2).await, b"hi");
    assert!(started.elapsed() >= Duration::from_secs(1));

    // The first worker lost the job to the timeout.
    assert_eq!(first.call("delete 1").await, "NOT_FOUND");
    assert_eq!(second.call("delete 1").await, "DELETED");
}

#[tokio::test(start_paused = true)]
async fn test_delayed_job_becomes_ready() {
    let broker = start(BrokerConfig::default());
    let mut client = Client::connect(&broker);

    client.send(b"put 0 2 10 2\r\nhi\r\n").await;
    assert_eq!(client.line().await, "INSERTED 1");
    assert_eq!(client.call("peek-ready").await, "NOT_FOUND");

    let started = Instant::now();
    assert_eq!(client.call("reserve").await, "RESERVED 1 2");
    assert_eq!(client.payload(2).await, b"hi");
    assert!(started.elapsed() >= Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn test_hanging_up_releases_jobs() {
    let broker = start(BrokerConfig::default());
    let mut first = Client::connect(&broker);
    let mut second = Client::connect(&broker);

    first.send(b"put 0 0 60 2\r\nhi\r\n").await;
    assert_eq!(first.line().await, "INSERTED 1");
    assert_eq!(first.call("reserve").await, "RESERVED 1 2");
    assert_eq!(first.payload(2).await, b"hi");

    second.send(b"reserve\r\n").await;
    second.silent().await;

    first.writer.shutdown().await.unwrap();
    first.task.await.unwrap().unwrap();

    assert_eq!(second.line().await, "RESERVED 1 2");
    assert_eq!(second.payload(2).await, b"hi");
}

#[tokio::test(start_paused = true)]
async fn test_quit() {
    let broker = start(BrokerConfig::default());
    let mut client = Client::connect(&broker);

    client.send(b"quit\r\n").await;
    client.task.await.unwrap().unwrap();

    assert!(client.reader.read_line().await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_malformed_commands() {
    let broker = start(BrokerConfig::default());
    let mut client = Client::connect(&broker);

    assert_eq!(client.call("frobnicate").await, "UNKNOWN_COMMAND");
    assert_eq!(client.call("put abc").await, "BAD_FORMAT");
    assert_eq!(client.call("use").await, "UNKNOWN_COMMAND");
    assert_eq!(client.call("list-tube-used").await, "USING default");
}

#[tokio::test(start_paused = true)]
async fn test_oversized_body_is_skipped() {
    let broker = start(BrokerConfig {
        max_job_size: 4,
        ..Default::default()
    });
    let mut client = Client::connect(&broker);

    client.send(b"put 0 0 10 10\r\n0123456789\r\n").await;
    assert_eq!(client.line().await, "JOB_TOO_BIG");
    assert_eq!(client.call("list-tube-used").await, "USING default");
    assert_eq!(client.call("peek-ready").await, "NOT_FOUND");
}

#[tokio::test(start_paused = true)]
async fn test_body_without_crlf() {
    let broker = start(BrokerConfig::default());
    let mut client = Client::connect(&broker);

    client.send(b"put 0 0 10 2\r\nhixx").await;
    assert_eq!(client.line().await, "EXPECTED_CRLF");
    assert_eq!(client.call("list-tube-used").await, "USING default");
}

#[tokio::test(start_paused = true)]
async fn test_stats() {
    let broker = start(BrokerConfig {
        hostname: "bean-host".to_string(),
        ..Default::default()
    });
    let mut client = Client::connect(&broker);

    let head = client.call("stats").await;
    let len: usize = head.strip_prefix("OK ").unwrap().parse().unwrap();
    let body = String::from_utf8(client.payload(len).await).unwrap();

    assert!(body.starts_with("---\n"));
    assert!(body.contains("current-connections: 1\n"));
    assert!(body.contains("cmd-stats: 1\n"));
    assert!(body.contains("hostname: bean-host\n"));
}
