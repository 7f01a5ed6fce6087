#![no_main]

use libfuzzer_sys::fuzz_target;

use aero_gpu_notify::protocol::decode_message_with_limits;
use aero_gpu_notify::{FrameParser, Limits, Message};

fuzz_target!(|data: &[u8]| {
    let limits = Limits {
        max_payload_len: 512,
    };

    // Whole-buffer decode must not panic, and anything it accepts must re-encode identically.
    if let Ok(message) = decode_message_with_limits(data, &limits) {
        let encoded = message.encode(&limits).expect("decoded message re-encodes");
        assert_eq!(
            decode_message_with_limits(&encoded, &limits).expect("re-encoded message decodes"),
            message
        );
    }

    // Streaming: the chunking must not change the frames produced.
    let split = data.first().map(|&b| b as usize % (data.len() + 1)).unwrap_or(0);
    let mut whole = FrameParser::with_limits(limits);
    let mut chunked = FrameParser::with_limits(limits);

    let expected = whole.push(data);
    let first = chunked.push(&data[..split]);
    let second = first
        .clone()
        .and_then(|mut frames| chunked.push(&data[split..]).map(|more| {
            frames.extend(more);
            frames
        }));

    match (expected, second) {
        (Ok(a), Ok(b)) => {
            assert_eq!(a, b);
            assert_eq!(whole.finish().is_ok(), chunked.finish().is_ok());
            for frame in a {
                let _ = Message::from_frame(frame);
            }
        }
        (Err(_), Err(_)) => {}
        (a, b) => panic!("chunking changed the outcome: {a:?} vs {b:?}"),
    }
});
