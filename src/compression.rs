use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use std::io;

// Every permessage-deflate payload is a raw deflate stream with the final
// empty stored block stripped; the trailer is re-appended before inflating
// and cut off after a sync flush when deflating.
const DEFLATE_TRAILER: [u8; 4] = [0, 0, 255, 255];

fn calculate_buffer_size(payload_size: usize) -> usize {
    if payload_size <= 4096 {
        4096 // 4 KB for small payloads
    } else if payload_size <= 65536 {
        16384 // 16 KB for medium payloads
    } else {
        65536 // 64 KB for large payloads
    }
}

pub(crate) struct Decoder {
    decompressor: Decompress,
    reset_context: bool,
}

impl Decoder {
    pub fn new(reset_context: bool, window_bits: Option<u8>) -> Self {
        let decompressor = if let Some(window_bits) = window_bits {
            Decompress::new_with_window_bits(false, window_bits)
        } else {
            Decompress::new(false)
        };
        Self {
            decompressor,
            reset_context,
        }
    }

    pub fn decompress(&mut self, payload: &[u8]) -> Result<Vec<u8>, io::Error> {
        let mut input = Vec::with_capacity(payload.len() + DEFLATE_TRAILER.len());
        input.extend_from_slice(payload);
        input.extend_from_slice(&DEFLATE_TRAILER);

        if self.reset_context {
            self.decompressor.reset(false);
        }

        // total_in() tracks the bytes consumed across calls. When context
        // takeover is active the decompressor keeps state between messages,
        // so consumption is measured relative to where this payload started.
        let before_in = self.decompressor.total_in();
        let mut output = Vec::with_capacity(calculate_buffer_size(payload.len()));

        loop {
            let consumed = (self.decompressor.total_in() - before_in) as usize;
            if consumed >= input.len() {
                break;
            }
            if output.len() == output.capacity() {
                output.reserve(4096);
            }
            match self.decompressor.decompress_vec(
                &input[consumed..],
                &mut output,
                FlushDecompress::Sync,
            )? {
                Status::StreamEnd => break,
                Status::Ok | Status::BufError => {}
            }
        }

        Ok(output)
    }
}

pub(crate) struct Encoder {
    compressor: Compress,
    reset_context: bool,
}

impl Encoder {
    pub fn new(reset_context: bool, window_bits: Option<u8>) -> Self {
        let compressor = if let Some(window_bits) = window_bits {
            Compress::new_with_window_bits(Compression::default(), false, window_bits)
        } else {
            Compress::new(Compression::default(), false)
        };
        Self {
            compressor,
            reset_context,
        }
    }

    pub fn compress(&mut self, payload: &[u8]) -> Result<Vec<u8>, io::Error> {
        if self.reset_context {
            self.compressor.reset();
        }

        let before_in = self.compressor.total_in();
        let mut output = Vec::with_capacity(calculate_buffer_size(payload.len()));

        loop {
            let consumed = (self.compressor.total_in() - before_in) as usize;
            if output.len() == output.capacity() {
                output.reserve(4096);
            }
            self.compressor
                .compress_vec(&payload[consumed..], &mut output, FlushCompress::Sync)?;

            let consumed = (self.compressor.total_in() - before_in) as usize;
            // The sync flush terminates with the empty stored block; once all
            // input went in and the trailer is out, the message is complete.
            if consumed == payload.len() && output.ends_with(&DEFLATE_TRAILER) {
                break;
            }
        }

        output.truncate(output.len() - DEFLATE_TRAILER.len());
        Ok(output)
    }
}
