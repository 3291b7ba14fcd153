//! Pins the exact on-wire byte layout for one concrete tuple.

use std::sync::Arc;

use c4::value::{DataType, Datum, Schema, Tuple};
use c4::wire::{encode_message, encode_tuple_body};

#[test]
fn tbl_i4_string_tuple_matches_the_canonical_byte_layout() {
    let schema = Arc::new(Schema::new(vec![DataType::I4, DataType::String], None));
    let tuple = Tuple::make(schema, vec![Datum::I4(5), Datum::String(Arc::from("hi"))]);

    let msg = encode_message("tbl", &encode_tuple_body(&tuple));

    assert_eq!(
        msg,
        vec![
            0x00, 0x03, 0x74, 0x62, 0x6C, // namelen=3, "tbl"
            0x00, 0x00, 0x00, 0x0C, // bodylen=12
            0x00, 0x00, 0x00, 0x05, // i4 = 5
            0x00, 0x00, 0x00, 0x02, 0x68, 0x69, // string "hi"
        ]
    );
}
