#![no_main]

use libfuzzer_sys::fuzz_target;
use watchroom_client::protocol::{decode, ServerFrame};
use watchroom_client::PlaybackState;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    // Decoding must never panic, and neither may normalizing whatever
    // video state a hostile relay sends.
    if let Ok(ServerFrame::Video { payload, .. }) = decode(text) {
        let state = PlaybackState::from_remote(&payload);
        let _ = state.video_url();
    }
});
