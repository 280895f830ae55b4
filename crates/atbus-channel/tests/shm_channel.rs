use atbus_channel::{RingError, ShmRing};

#[test]
fn shared_segment_roundtrip() {
    // key unique per run so parallel CI jobs don't collide
    let key = 0x5af0_0000 + u64::from(std::process::id());

    let listener = ShmRing::create_or_open(key, 256 * 1024, None).unwrap();
    let sender = ShmRing::open(key).unwrap();
    assert_eq!(listener.key(), sender.key());

    let msg = b"over the wall";
    sender.channel().send(msg).unwrap();

    let mut out = [0u8; 128];
    let n = listener.channel().recv(&mut out, 1).unwrap();
    assert_eq!(&out[..n], msg);
    assert_eq!(listener.channel().recv(&mut out, 2).unwrap_err(), RingError::NoData);

    // reattaching with create_or_open lands on the same segment
    let second = ShmRing::create_or_open(key, 256 * 1024, None).unwrap();
    second.channel().send(b"again").unwrap();
    let n = listener.channel().recv(&mut out, 3).unwrap();
    assert_eq!(&out[..n], b"again");
}

#[test]
fn open_missing_segment_fails() {
    assert_eq!(ShmRing::open(0xdead_beef_0bad_cafe).unwrap_err(), RingError::ShmNotFound);
}
