#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use wa_transport::protocol::frame::{classify, open_payload, InboundFrame, Payload};
use wa_transport::transport::WireFrame;
use wa_transport::SessionKeys;

fuzz_target!(|data: &[u8]| {
    let keys = SessionKeys::new(vec![0x11; 32], vec![0x22; 32]);
    if let Ok(InboundFrame::Tagged { payload: Payload::Binary(body), .. }) =
        classify(WireFrame::Binary(Bytes::copy_from_slice(data)))
    {
        let _ = open_payload(&keys, &body);
    }
});
