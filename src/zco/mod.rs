//! Zero-copy objects.
//!
//! A [`Zco`] is a composite buffer: an ordered chain of source extents that
//! reference file regions or heap byte arrays through reference-counted
//! descriptors, plus chains of explicit header and trailer capsules. The
//! same backing bytes can be cited by many ZCOs at once (see [`clone`]);
//! nothing is copied until a reader drains the object toward a socket or an
//! application buffer.
//!
//! All state lives in the durable heap; every operation takes a [`Txn`].
//! Occupancy of the heap and of referenced file bytes is tracked against
//! configurable caps in the `"zcodb"` catalog record.
//!
//! [`Txn`]: crate::store::Txn

mod object;
mod reader;

pub use object::{
    append_extent, clone, create, create_file_ref, destroy, destroy_file_ref, delimit_source,
    discard_first_header, discard_last_trailer, enough_file_space, enough_heap_space,
    file_occupancy, file_ref_path, file_ref_xmit_eof, heap_occupancy, length, prepend_header,
    revise_file_ref, set_max_file_occupancy, set_max_heap_occupancy, source_data_length, strip,
    append_trailer, FileRef, Zco, ZcoMedium, FILE_FILL_CHAR,
};
pub use reader::ZcoReader;
