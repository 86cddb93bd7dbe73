use anyhow::bail;
use bytes::{Buf, BufMut, Bytes};
use bytes_varint::{VarIntSupport, VarIntSupportMut};

/// writes a byte slice with its (varint encoded) length as a prefix
pub fn put_len_prefixed(buf: &mut impl BufMut, data: &[u8]) {
    buf.put_usize_varint(data.len());
    buf.put_slice(data);
}

/// reads a length-prefixed byte sequence as written by [put_len_prefixed], failing if the buffer
///  is shorter than the announced length
pub fn try_get_len_prefixed(buf: &mut impl Buf) -> anyhow::Result<Bytes> {
    let len = buf.try_get_usize_varint()?;
    if buf.remaining() < len {
        bail!("buffer underflow: {} bytes announced, {} remaining", len, buf.remaining());
    }
    Ok(buf.copy_to_bytes(len))
}

#[cfg(test)]
mod tests {
    use bytes::{Buf, BytesMut};
    use rstest::rstest;
    use crate::util::buf::{put_len_prefixed, try_get_len_prefixed};

    #[rstest]
    #[case::empty("", vec![0])]
    #[case::a("a", vec![1,97])]
    #[case::abc("abc", vec![3,97,98,99])]
    #[case::umlaut("ä", vec![2,0xc3,0xa4])]
    #[case::heart("❤️", vec![6, 226,157,164,239,184,143])]
    #[case::hearts("❤️❤️❤️❤️❤️❤️❤️❤️❤️❤️❤️❤️❤️❤️❤️❤️❤️❤️❤️❤️❤️❤️", vec![
        132,1, //NB: length is variable-length encoded
        226,157,164,239,184,143,
        226,157,164,239,184,143,
        226,157,164,239,184,143,
        226,157,164,239,184,143,
        226,157,164,239,184,143,
        226,157,164,239,184,143,
        226,157,164,239,184,143,
        226,157,164,239,184,143,
        226,157,164,239,184,143,
        226,157,164,239,184,143,
        226,157,164,239,184,143,
        226,157,164,239,184,143,
        226,157,164,239,184,143,
        226,157,164,239,184,143,
        226,157,164,239,184,143,
        226,157,164,239,184,143,
        226,157,164,239,184,143,
        226,157,164,239,184,143,
        226,157,164,239,184,143,
        226,157,164,239,184,143,
        226,157,164,239,184,143,
        226,157,164,239,184,143,
    ])]
    fn test_put_len_prefixed(#[case] s: &str, #[case] expected: Vec<u8>) {
        let mut buf = BytesMut::new();
        put_len_prefixed(&mut buf, s.as_bytes());
        assert_eq!(&buf, &expected);

        let mut deser_buf: &[u8] = &buf;
        let deser = try_get_len_prefixed(&mut deser_buf).unwrap();
        assert!(deser_buf.is_empty());
        assert_eq!(deser.as_ref(), s.as_bytes());
    }

    #[test]
    fn test_try_get_len_prefixed_remaining() {
        let mut deser_buf: &[u8] = b"\x01abc";
        let actual = try_get_len_prefixed(&mut deser_buf).unwrap();
        assert_eq!(actual.as_ref(), b"a");
        assert_eq!(deser_buf.chunk(), b"bc");
    }

    #[test]
    fn test_try_get_len_prefixed_too_short() {
        let mut deser_buf: &[u8] = b"\x02a";
        assert!(try_get_len_prefixed(&mut deser_buf).is_err());
    }

    #[test]
    fn test_try_get_len_prefixed_no_length() {
        let mut deser_buf: &[u8] = b"";
        assert!(try_get_len_prefixed(&mut deser_buf).is_err());
    }
}
