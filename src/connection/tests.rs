use super::*;
use crate::crypto::{SigningAlgorithm, SigningKey};
use crate::protocol::negotiate::{NegotiateContext, Smb2NegotiateRequest};
use crate::protocol::smb2_constants::{
    status, EncryptionCipher, Smb2Capabilities, Smb2Dialect, Smb2HeaderFlags,
    UNSOLICITED_MESSAGE_ID,
};
use crate::protocol::{Smb2Header, Smb2TransformHeader, SmbMessage};
use crate::transport::{DirectTcpReader, DirectTcpWriter};
use rstest::rstest;
use std::sync::atomic::AtomicBool;
use std::time::Duration;
use tokio::sync::mpsc;

/// Hands every written frame to the test
struct ChannelWriter {
    frames: mpsc::UnboundedSender<Bytes>,
    fail: Arc<AtomicBool>,
}

#[async_trait]
impl TransportWriter for ChannelWriter {
    async fn send(&mut self, data: Bytes) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "broken pipe",
            )));
        }
        self.frames.send(data).map_err(|_| Error::ConnectionClosed)
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

struct Harness {
    connection: Connection,
    frames: mpsc::UnboundedReceiver<Bytes>,
    fail: Arc<AtomicBool>,
}

impl Harness {
    fn new(config: ConnectionConfig) -> Self {
        let (tx, frames) = mpsc::unbounded_channel();
        let fail = Arc::new(AtomicBool::new(false));
        let writer = ChannelWriter {
            frames: tx,
            fail: fail.clone(),
        };
        Self {
            connection: Connection::new(config, Box::new(writer)),
            frames,
            fail,
        }
    }

    async fn next_frame(&mut self) -> Bytes {
        self.frames.recv().await.unwrap()
    }

    async fn next_header(&mut self) -> Smb2Header {
        Smb2Header::parse(&self.next_frame().await).unwrap()
    }

    /// Whether nothing gets written for a while
    async fn quiet(&mut self) -> bool {
        tokio::time::timeout(Duration::from_millis(50), self.frames.recv())
            .await
            .is_err()
    }
}

fn echo() -> OutboundMessage {
    OutboundMessage::new(Smb2Command::Echo, vec![4, 0, 0, 0])
}

fn reply(message_id: u64, credits: u16) -> OutboundMessage {
    let mut message = echo();
    message.header.flags |= Smb2HeaderFlags::SERVER_TO_REDIR;
    message.header.message_id = message_id;
    message.header.credits = credits;
    message
}

fn reply_bytes(message_id: u64, credits: u16) -> Bytes {
    Bytes::from(reply(message_id, credits).to_bytes().unwrap())
}

fn large_mtu(dialect: Smb2Dialect) -> NegotiatedProtocol {
    let mut negotiated = NegotiatedProtocol::new(dialect);
    negotiated.capabilities = Smb2Capabilities::LARGE_MTU;
    negotiated
}

#[rstest]
#[case::single_credit_dialect(4, 100, false, 1)]
#[case::fits(4, 100, true, 4)]
#[case::exactly_available(4, 4, true, 3)]
#[case::short(8, 3, true, 2)]
#[case::last_credit(4, 1, true, 1)]
#[case::nothing_left(2, 0, true, 1)]
#[case::zero_payload(0, 10, true, 1)]
fn test_grant_credits(
    #[case] needed: u16,
    #[case] available: usize,
    #[case] multi_credit: bool,
    #[case] expected: u16,
) {
    assert_eq!(grant_credits(needed, available, multi_credit), expected);
}

#[rstest]
#[case(512, 1, 1, 510)]
#[case(512, 100, 4, 408)]
#[case(512, 600, 1, 1)]
#[case(512, 510, 8, 8)]
fn test_credit_request(
    #[case] preferred: u16,
    #[case] available: usize,
    #[case] granted: u16,
    #[case] expected: u16,
) {
    assert_eq!(credit_request(preferred, available, granted), expected);
}

#[tokio::test(start_paused = true)]
async fn test_credit_starvation_blocks_second_sender() {
    let mut harness = Harness::new(ConnectionConfig::default());
    let connection = harness.connection.clone();

    let mut tasks = Vec::new();
    for _ in 0..2 {
        let connection = connection.clone();
        tasks.push(tokio::spawn(async move {
            connection.send_and_receive(echo()).await
        }));
    }

    assert_eq!(harness.next_header().await.message_id, 0);
    assert!(harness.quiet().await, "second sender went out without a credit");

    connection.handle(reply_bytes(0, 1)).await.unwrap();
    assert_eq!(harness.next_header().await.message_id, 1);
    connection.handle(reply_bytes(1, 1)).await.unwrap();

    let mut ids = Vec::new();
    for task in tasks {
        ids.push(task.await.unwrap().unwrap().message_id());
    }
    ids.sort();
    assert_eq!(ids, vec![0, 1]);
    assert_eq!(connection.available_credits(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_credit_wait_gives_up() {
    let config = ConnectionConfig {
        credit_timeout: Duration::from_secs(2),
        ..Default::default()
    };
    let mut harness = Harness::new(config);
    let _first = harness.connection.send(echo()).await.unwrap();
    harness.next_frame().await;

    let err = harness.connection.send(echo()).await.unwrap_err();
    assert!(matches!(err, Error::CreditsExhausted { .. }));
    assert!(!err.is_connection_fatal());
    assert!(!harness.connection.is_closed());
}

#[tokio::test]
async fn test_multi_credit_stamping() {
    let mut harness = Harness::new(ConnectionConfig::default());
    let connection = harness.connection.clone();
    connection
        .apply_negotiated(large_mtu(Smb2Dialect::Smb311))
        .unwrap();

    let first = connection.send(echo()).await.unwrap();
    let header = harness.next_header().await;
    assert_eq!(header.credit_charge, 1);
    assert_eq!(header.credits, 510);
    connection.handle(reply_bytes(0, 100)).await.unwrap();
    first.wait().await.unwrap();

    let read = OutboundMessage::new(Smb2Command::Read, vec![0x31, 0])
        .with_payload_size(200_000);
    let _handle = connection.send(read).await.unwrap();
    let header = harness.next_header().await;
    assert_eq!(header.message_id, 1);
    assert_eq!(header.credit_charge, 4);
    assert_eq!(header.credits, 408);
    assert_eq!(connection.available_credits(), 96);

    let _next = connection.send(echo()).await.unwrap();
    assert_eq!(harness.next_header().await.message_id, 5);
}

#[tokio::test]
async fn test_smb202_has_no_credit_charge() {
    let mut harness = Harness::new(ConnectionConfig::default());
    harness
        .connection
        .apply_negotiated(large_mtu(Smb2Dialect::Smb202))
        .unwrap();
    let _handle = harness
        .connection
        .send(echo().with_payload_size(300_000))
        .await
        .unwrap();
    assert_eq!(harness.next_header().await.credit_charge, 0);
}

#[tokio::test]
async fn test_async_pending_then_cancel() {
    let mut harness = Harness::new(ConnectionConfig::default());
    let connection = harness.connection.clone();

    let notify = OutboundMessage::new(Smb2Command::ChangeNotify, vec![32, 0]).with_session(0x41);
    let handle = connection.send(notify).await.unwrap();
    let sent = harness.next_header().await;

    let mut interim = reply(sent.message_id, 1).with_session(0x41);
    interim.header.command = Smb2Command::ChangeNotify;
    interim.header.flags |= Smb2HeaderFlags::ASYNC_COMMAND;
    interim.header.status = status::PENDING;
    interim.header.async_id = 0xA5;
    connection
        .handle(Bytes::from(interim.to_bytes().unwrap()))
        .await
        .unwrap();
    assert!(!handle.is_done());

    assert!(handle.cancel().await.unwrap());
    let cancel = harness.next_header().await;
    assert_eq!(cancel.command, Smb2Command::Cancel);
    assert_eq!(cancel.message_id, sent.message_id);
    assert!(cancel.is_async());
    assert_eq!(cancel.async_id, 0xA5);
    assert_eq!(cancel.session_id, 0x41);
    assert!(!handle.cancel().await.unwrap());
    assert_eq!(connection.outstanding_requests(), 1);

    let mut last = reply(sent.message_id, 1).with_session(0x41);
    last.header.flags |= Smb2HeaderFlags::ASYNC_COMMAND;
    last.header.async_id = 0xA5;
    last.header.status = status::CANCELLED;
    last.body = Bytes::from_static(&[9, 0, 0, 0, 0, 0, 0, 0, 0]);
    connection
        .handle(Bytes::from(last.to_bytes().unwrap()))
        .await
        .unwrap();

    assert!(handle.is_done());
    assert!(!handle.cancel().await.unwrap());
    assert!(matches!(handle.wait().await, Err(Error::Cancelled)));
    assert_eq!(connection.outstanding_requests(), 0);
}

#[tokio::test]
async fn test_cancel_message_is_not_registered() {
    let mut harness = Harness::new(ConnectionConfig::default());
    let cancel = crate::protocol::Smb2CancelRequest::for_request(42, None, 0);
    let handle = harness.connection.send(cancel).await.unwrap();

    let header = harness.next_header().await;
    assert_eq!(header.command, Smb2Command::Cancel);
    assert_eq!(header.message_id, 42);
    assert_eq!(harness.connection.outstanding_requests(), 0);
    // no credit was spent on it
    assert_eq!(harness.connection.available_credits(), 1);
    assert!(handle.is_done());
}

#[tokio::test(start_paused = true)]
async fn test_timeout_then_late_reply() {
    let config = ConnectionConfig {
        response_timeout: Duration::from_secs(1),
        ..Default::default()
    };
    let mut harness = Harness::new(config);
    let connection = harness.connection.clone();

    let err = connection.send_and_receive(echo()).await.unwrap_err();
    assert!(matches!(err, Error::Timeout));
    assert!(!err.is_connection_fatal());
    harness.next_frame().await;
    assert_eq!(connection.outstanding_requests(), 1);

    connection.handle(reply_bytes(0, 2)).await.unwrap();
    assert_eq!(connection.outstanding_requests(), 0);
    assert_eq!(connection.available_credits(), 2);
    assert!(!connection.is_closed());
}

#[tokio::test]
async fn test_transport_failure_drains_everyone() {
    let config = ConnectionConfig {
        enforce_credits: false,
        ..Default::default()
    };
    let harness = Harness::new(config);
    let connection = harness.connection.clone();

    let mut handles = Vec::new();
    for _ in 0..3 {
        handles.push(connection.send(echo()).await.unwrap());
    }
    assert_eq!(connection.outstanding_requests(), 3);

    connection
        .handle_error(Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "connection reset by peer",
        )))
        .await;

    for handle in handles {
        assert!(matches!(handle.wait().await, Err(Error::ConnectionError(_))));
    }
    assert!(connection.is_closed());
    assert!(matches!(
        connection.send(echo()).await,
        Err(Error::ConnectionClosed)
    ));
}

#[tokio::test]
async fn test_write_failure_closes_connection() {
    let harness = Harness::new(ConnectionConfig::default());
    harness.fail.store(true, Ordering::SeqCst);

    let err = harness.connection.send(echo()).await.unwrap_err();
    assert!(matches!(err, Error::Io(_)));
    assert!(harness.connection.is_closed());
    assert_eq!(harness.connection.outstanding_requests(), 0);
}

#[tokio::test]
async fn test_failed_encryption_returns_credits() {
    let config = ConnectionConfig {
        encrypt_data: true,
        ..Default::default()
    };
    let mut harness = Harness::new(config);
    let connection = harness.connection.clone();
    let mut negotiated = NegotiatedProtocol::new(Smb2Dialect::Smb311);
    negotiated.cipher = Some(EncryptionCipher::Aes128Gcm);
    connection.apply_negotiated(negotiated).unwrap();

    let mut session = SessionContext::guest(0x42);
    session.encryption_key = Some(vec![7u8; 5]);
    connection.register_session(session);
    assert_eq!(connection.available_credits(), 1);

    assert!(connection.send(echo().with_session(0x42)).await.is_err());
    assert_eq!(connection.available_credits(), 1);
    assert_eq!(connection.outstanding_requests(), 0);
    assert!(!connection.is_closed());

    let _handle = connection.send(echo()).await.unwrap();
    assert_eq!(harness.next_header().await.message_id, 1);
}

/// Accepts a frame and never finishes writing it
struct StalledWriter;

#[async_trait]
impl TransportWriter for StalledWriter {
    async fn send(&mut self, _data: Bytes) -> Result<()> {
        std::future::pending().await
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_send_returns_credits() {
    let connection = Connection::new(ConnectionConfig::default(), Box::new(StalledWriter));

    let abandoned =
        tokio::time::timeout(Duration::from_millis(100), connection.send(echo())).await;
    assert!(abandoned.is_err());
    assert_eq!(connection.outstanding_requests(), 0);
    assert_eq!(connection.available_credits(), 1);
}

#[tokio::test]
async fn test_close_fails_pending_requests() {
    let harness = Harness::new(ConnectionConfig::default());
    let handle = harness.connection.send(echo()).await.unwrap();
    harness.connection.close().await;
    assert!(matches!(handle.wait().await, Err(Error::ConnectionClosed)));
}

#[tokio::test]
async fn test_signed_session_round_trip() {
    let mut harness = Harness::new(ConnectionConfig::default());
    let connection = harness.connection.clone();
    connection
        .apply_negotiated(NegotiatedProtocol::new(Smb2Dialect::Smb210))
        .unwrap();

    let session_key = [0x6eu8; 16];
    let session = SessionContext::derive(
        0x77,
        Smb2Dialect::Smb210,
        &session_key,
        None,
        EncryptionCipher::Aes128Ccm,
    )
    .unwrap()
    .with_signing_required(true);
    connection.register_session(session);
    let key = SigningKey::new(SigningAlgorithm::HmacSha256, session_key.to_vec());
    let signatory = PacketSignatory::new();

    let handle = connection.send(echo().with_session(0x77)).await.unwrap();
    let frame = harness.next_frame().await;
    assert!(Smb2Header::parse(&frame).unwrap().is_signed());
    assert!(signatory.verify(&frame, &key).unwrap());

    let mut good = reply(0, 1).with_session(0x77);
    let bytes = signatory.sign(&mut good, Some(&key)).unwrap();
    connection.handle(Bytes::from(bytes)).await.unwrap();
    assert_eq!(handle.wait().await.unwrap().message_id(), 0);

    let pending = connection.send(echo().with_session(0x77)).await.unwrap();
    harness.next_frame().await;
    let mut bad = reply(1, 1).with_session(0x77);
    let mut bytes = signatory.sign(&mut bad, Some(&key)).unwrap();
    bytes[65] ^= 0x20;

    let err = connection.handle(Bytes::from(bytes)).await.unwrap_err();
    assert!(matches!(err, Error::SignatureMismatch { message_id: 1 }));
    assert!(connection.is_closed());
    assert!(matches!(pending.wait().await, Err(Error::ConnectionError(_))));
}

#[tokio::test]
async fn test_encrypted_session_round_trip() {
    let config = ConnectionConfig {
        encrypt_data: true,
        ..Default::default()
    };
    let mut harness = Harness::new(config);
    let connection = harness.connection.clone();
    let mut negotiated = NegotiatedProtocol::new(Smb2Dialect::Smb311);
    negotiated.cipher = Some(EncryptionCipher::Aes128Gcm);
    connection.apply_negotiated(negotiated.clone()).unwrap();

    let preauth = [0x10u8; 64];
    let session = SessionContext::derive(
        0x99,
        Smb2Dialect::Smb311,
        &[0x44u8; 16],
        Some(&preauth),
        EncryptionCipher::Aes128Gcm,
    )
    .unwrap();
    let client_key = session.encryption_key.clone().unwrap();
    let server_key = session.decryption_key.clone().unwrap();
    connection.register_session(session);

    // the server side of the same cipher
    let server = PacketEncryptor::new();
    server.init(&negotiated).unwrap();

    let handle = connection.send(echo().with_session(0x99)).await.unwrap();
    let frame = harness.next_frame().await;
    assert!(Smb2TransformHeader::is_transform(&frame));
    let plaintext = server.decrypt(&frame, &client_key).unwrap();
    let header = Smb2Header::parse(&plaintext).unwrap();
    assert_eq!(header.command, Smb2Command::Echo);
    assert!(!header.is_signed());

    let answer = reply(header.message_id, 3).with_session(0x99).to_bytes().unwrap();
    let record = server.encrypt(&answer, 0x99, &server_key).unwrap();
    connection.handle(Bytes::from(record)).await.unwrap();
    assert_eq!(handle.wait().await.unwrap().message_id(), 0);
    assert_eq!(connection.available_credits(), 3);
}

#[tokio::test]
async fn test_unsolicited_messages_reach_listener() {
    let harness = Harness::new(ConnectionConfig::default());
    let (tx, mut rx) = mpsc::unbounded_channel();
    harness.connection.set_unsolicited_listener(tx);

    let mut oplock = reply(UNSOLICITED_MESSAGE_ID, 0);
    oplock.header.command = Smb2Command::OplockBreak;
    harness
        .connection
        .handle(Bytes::from(oplock.to_bytes().unwrap()))
        .await
        .unwrap();

    let notification = rx.recv().await.unwrap();
    assert_eq!(notification.header.command, Smb2Command::OplockBreak);
    assert!(!harness.connection.is_closed());
}

#[tokio::test]
async fn test_disabled_credits_never_block() {
    let config = ConnectionConfig {
        enforce_credits: false,
        credit_timeout: Duration::from_millis(10),
        ..Default::default()
    };
    let harness = Harness::new(config);
    for expected in 0..10u64 {
        let handle = harness.connection.send(echo()).await.unwrap();
        assert_eq!(handle.message_id(), expected);
    }
}

/// Minimal server: answers one NEGOTIATE over the direct TCP framing
async fn serve_negotiate(stream: tokio::io::DuplexStream) -> Smb2NegotiateRequest {
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = DirectTcpReader::new(read_half);
    let mut writer = DirectTcpWriter::new(write_half);

    let frame = reader.receive().await.unwrap();
    let header = Smb2Header::parse(&frame).unwrap();
    assert_eq!(header.command, Smb2Command::Negotiate);
    let request = Smb2NegotiateRequest::parse(&frame[Smb2Header::SIZE..]).unwrap();

    let mut body = Smb2NegotiateResponse::new(Smb2Dialect::Smb311);
    body.capabilities = Smb2Capabilities::LARGE_MTU | Smb2Capabilities::ENCRYPTION;
    body.negotiate_contexts = vec![
        NegotiateContext::sha512_preauth(),
        NegotiateContext::EncryptionCapabilities {
            ciphers: vec![EncryptionCipher::Aes128Gcm.to_u16()],
        },
    ];
    let mut response = OutboundMessage::from_message(Smb2Command::Negotiate, &body).unwrap();
    response.header.flags |= Smb2HeaderFlags::SERVER_TO_REDIR;
    response.header.message_id = header.message_id;
    response.header.credits = 10;
    writer
        .send(Bytes::from(response.to_bytes().unwrap()))
        .await
        .unwrap();
    request
}

#[tokio::test]
async fn test_negotiate_over_framed_transport() {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let server = tokio::spawn(serve_negotiate(server));

    let (read_half, write_half) = tokio::io::split(client);
    let connection = Connection::start(
        ConnectionConfig::default(),
        DirectTcpReader::new(read_half),
        DirectTcpWriter::new(write_half),
    );

    let negotiated = connection.negotiate().await.unwrap();
    assert_eq!(negotiated.dialect, Smb2Dialect::Smb311);
    assert_eq!(negotiated.cipher, Some(EncryptionCipher::Aes128Gcm));
    assert!(negotiated.supports_multi_credit());
    assert_eq!(negotiated.preauth_hash.as_ref().map(Vec::len), Some(64));
    assert_eq!(connection.negotiated(), Some(negotiated));
    assert_eq!(connection.available_credits(), 10);

    let request = server.await.unwrap();
    assert!(request.dialects.contains(&Smb2Dialect::Smb311));
    assert_eq!(request.negotiate_contexts.len(), 2);

    // the server hung up; the reader task fails the connection
    tokio::time::timeout(Duration::from_secs(5), async {
        while !connection.is_closed() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();
}
