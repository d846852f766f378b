// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wire encoding of [`Endpoint`]: `[u8 family][bytes]`,
//! `family=2` IPv4 (`4B addr + 2B port`), `family=10` IPv6 (`16B addr +
//! 2B port`), `family=1` local/unix (`u16 length + path bytes`).

use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::path::PathBuf;

use bsched_kernel::Endpoint;

use crate::error::WireError;

const FAMILY_UNIX: u8 = 1;
const FAMILY_V4: u8 = 2;
const FAMILY_V6: u8 = 10;

/// An `Option<Endpoint>` is wire-encoded by writing a leading presence
/// byte (the header format does not otherwise distinguish "empty" from a
/// real endpoint) followed by the tagged encoding when present.
pub fn write_endpoint(out: &mut dyn Write, endpoint: Option<&Endpoint>) -> io::Result<()> {
    match endpoint {
        None => out.write_all(&[0]),
        Some(Endpoint::Ip(SocketAddr::V4(v4))) => {
            out.write_all(&[1, FAMILY_V4])?;
            out.write_all(&v4.ip().octets())?;
            out.write_all(&v4.port().to_be_bytes())
        }
        Some(Endpoint::Ip(SocketAddr::V6(v6))) => {
            out.write_all(&[1, FAMILY_V6])?;
            out.write_all(&v6.ip().octets())?;
            out.write_all(&v6.port().to_be_bytes())
        }
        Some(Endpoint::Unix(path)) => {
            out.write_all(&[1, FAMILY_UNIX])?;
            let bytes = path.to_string_lossy();
            let bytes = bytes.as_bytes();
            out.write_all(&(bytes.len() as u16).to_be_bytes())?;
            out.write_all(bytes)
        }
    }
}

pub fn read_endpoint(input: &mut dyn Read) -> Result<Option<Endpoint>, WireError> {
    let mut present = [0u8; 1];
    input.read_exact(&mut present)?;
    if present[0] == 0 {
        return Ok(None);
    }

    let mut family = [0u8; 1];
    input.read_exact(&mut family)?;
    match family[0] {
        FAMILY_V4 => {
            let mut octets = [0u8; 4];
            input.read_exact(&mut octets)?;
            let mut port = [0u8; 2];
            input.read_exact(&mut port)?;
            let addr = SocketAddrV4::new(Ipv4Addr::from(octets), u16::from_be_bytes(port));
            Ok(Some(Endpoint::Ip(SocketAddr::V4(addr))))
        }
        FAMILY_V6 => {
            let mut octets = [0u8; 16];
            input.read_exact(&mut octets)?;
            let mut port = [0u8; 2];
            input.read_exact(&mut port)?;
            let addr = SocketAddrV6::new(Ipv6Addr::from(octets), u16::from_be_bytes(port), 0, 0);
            Ok(Some(Endpoint::Ip(SocketAddr::V6(addr))))
        }
        FAMILY_UNIX => {
            let mut len = [0u8; 2];
            input.read_exact(&mut len)?;
            let mut path_bytes = vec![0u8; u16::from_be_bytes(len) as usize];
            input.read_exact(&mut path_bytes)?;
            Ok(Some(Endpoint::Unix(PathBuf::from(
                String::from_utf8_lossy(&path_bytes).into_owned(),
            ))))
        }
        other => Err(WireError::BadAddressTag(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_round_trips() {
        let mut buf = Vec::new();
        write_endpoint(&mut buf, None).unwrap();
        let mut cursor: &[u8] = &buf;
        assert_eq!(read_endpoint(&mut cursor).unwrap(), None);
    }

    #[test]
    fn ipv4_round_trips() {
        let ep = Endpoint::Ip("127.0.0.1:9000".parse().unwrap());
        let mut buf = Vec::new();
        write_endpoint(&mut buf, Some(&ep)).unwrap();
        let mut cursor: &[u8] = &buf;
        assert_eq!(read_endpoint(&mut cursor).unwrap(), Some(ep));
    }

    #[test]
    fn ipv6_round_trips() {
        let ep = Endpoint::Ip("[::1]:9000".parse().unwrap());
        let mut buf = Vec::new();
        write_endpoint(&mut buf, Some(&ep)).unwrap();
        let mut cursor: &[u8] = &buf;
        assert_eq!(read_endpoint(&mut cursor).unwrap(), Some(ep));
    }

    #[test]
    fn unix_round_trips() {
        let ep = Endpoint::Unix(PathBuf::from("/tmp/bsched.sock"));
        let mut buf = Vec::new();
        write_endpoint(&mut buf, Some(&ep)).unwrap();
        let mut cursor: &[u8] = &buf;
        assert_eq!(read_endpoint(&mut cursor).unwrap(), Some(ep));
    }

    #[test]
    fn bad_family_tag_is_an_error() {
        let buf = vec![1u8, 99];
        let mut cursor: &[u8] = &buf;
        assert!(matches!(
            read_endpoint(&mut cursor),
            Err(WireError::BadAddressTag(99))
        ));
    }
}
