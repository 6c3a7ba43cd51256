//! Response body decoding: the chunked transfer coding state machine and the
//! strategy selection that turns a framed head into a materialized body.

pub use chunked::{
    apply_chunked_body, is_forbidden_trailer, ChunkDecoder, ChunkEvent, ChunkRecord,
    ChunkedBody, DecoderState, FORBIDDEN_TRAILERS,
};
pub use materializer::{BodyMaterializer, BodyStrategy};

mod chunked;
mod materializer;
