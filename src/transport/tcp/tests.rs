use super::*;
use tokio::io::duplex;

#[tokio::test]
async fn test_frames_survive_the_stream() {
    let (client, server) = duplex(1024);
    let mut writer = DirectTcpWriter::new(client);
    let mut reader = DirectTcpReader::new(server);

    writer.send(Bytes::from_static(b"\xfeSMB first")).await.unwrap();
    writer.send(Bytes::from(vec![0x42u8; 3000])).await.unwrap();

    assert_eq!(&reader.receive().await.unwrap()[..], b"\xfeSMB first");
    let second = reader.receive().await.unwrap();
    assert_eq!(second.len(), 3000);
    assert!(second.iter().all(|b| *b == 0x42));
}

#[tokio::test]
async fn test_frame_header_layout() {
    let frame = encode_frame(&[1, 2, 3]).unwrap();
    assert_eq!(&frame[..], &[0, 0, 0, 3, 1, 2, 3]);
    assert_eq!(decode_frame_length([0, 0x01, 0x00, 0x00]).unwrap(), 65536);
}

#[tokio::test]
async fn test_rejects_bad_frame_type_and_oversize() {
    assert!(matches!(
        decode_frame_length([0x85, 0, 0, 0]),
        Err(Error::Protocol(_))
    ));
    assert!(matches!(
        decode_frame_length([0, 0x80, 0, 1]),
        Err(Error::Protocol(_))
    ));
    assert!(encode_frame(&vec![0u8; MAX_FRAME_SIZE + 1]).is_err());
}

#[tokio::test]
async fn test_clean_close_vs_truncated_frame() {
    let (client, server) = duplex(64);
    let mut reader = DirectTcpReader::new(server);
    drop(client);
    assert!(matches!(reader.receive().await, Err(Error::ConnectionClosed)));

    let (mut client, server) = duplex(64);
    let mut reader = DirectTcpReader::new(server);
    client.write_all(&[0, 0, 0, 10, 1, 2]).await.unwrap();
    drop(client);
    assert!(matches!(reader.receive().await, Err(Error::Io(_))));
}

#[tokio::test]
async fn test_send_after_close_fails() {
    let (client, _server) = duplex(64);
    let mut writer = DirectTcpWriter::new(client);
    writer.close().await.unwrap();
    assert!(!writer.is_connected());
    assert!(matches!(
        writer.send(Bytes::from_static(b"x")).await,
        Err(Error::ConnectionClosed)
    ));
}
