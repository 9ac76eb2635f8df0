//! SDP line parsing
//!
//! Each SDP line has the form `<type>=<value>` where type is a single
//! lowercase letter. The session section must carry `v=`, `o=` and `s=`; at
//! least one `m=` section is required for a description the negotiation core
//! can act on. Lines this module does not interpret are kept verbatim.

use nom::{
    bytes::complete::take_while1,
    character::complete::{anychar, char, digit1, space1},
    combinator::{all_consuming, map_res, opt, verify},
    multi::separated_list1,
    sequence::preceded,
    IResult,
};

use super::description::{MediaSection, Origin, SdpLine, SessionDescription};
use crate::error::{Error, Result};

/// Escaped CRLF placeholder used when SDP travels through a single text line
pub const ESCAPED_CRLF: &str = "\\r\\n";

/// Parse an SDP line into its type character and value
///
/// ```
/// use peerlink_negotiation_core::sdp::parser::parse_sdp_line;
///
/// let (_, (key, value)) = parse_sdp_line("a=rtpmap:111 opus/48000/2").unwrap();
/// assert_eq!(key, 'a');
/// assert_eq!(value, "rtpmap:111 opus/48000/2");
/// ```
pub fn parse_sdp_line(input: &str) -> IResult<&str, (char, &str)> {
    let (input, key) = verify(anychar, |c: &char| c.is_ascii_lowercase())(input)?;
    let (value, _) = char('=')(input)?;
    Ok(("", (key, value)))
}

fn token(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| !c.is_whitespace())(input)
}

fn port(input: &str) -> IResult<&str, u16> {
    map_res(digit1, |s: &str| s.parse::<u16>())(input)
}

/// Parsed `m=` line fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaLine<'a> {
    pub media: &'a str,
    pub port: u16,
    pub port_count: Option<u16>,
    pub protocol: &'a str,
    pub formats: Vec<&'a str>,
}

/// Parse the value of an `m=` line
///
/// Format: `<media> <port>[/<port-count>] <proto> <fmt> [<fmt>]*`
pub fn parse_media_line(input: &str) -> IResult<&str, MediaLine<'_>> {
    let (input, media) = token(input)?;
    let (input, _) = space1(input)?;
    let (input, port_number) = port(input)?;
    let (input, port_count) = opt(preceded(char('/'), port))(input)?;
    let (input, _) = space1(input)?;
    let (input, protocol) = token(input)?;
    let (input, _) = space1(input)?;
    let (input, formats) = separated_list1(space1, token)(input)?;

    Ok((
        input,
        MediaLine {
            media,
            port: port_number,
            port_count,
            protocol,
            formats,
        },
    ))
}

/// Parse the value of an `o=` line
///
/// Format: `<username> <sess-id> <sess-version> <nettype> <addrtype> <unicast-address>`
pub fn parse_origin_line(input: &str) -> IResult<&str, Origin> {
    let (input, username) = token(input)?;
    let (input, _) = space1(input)?;
    let (input, session_id) = token(input)?;
    let (input, _) = space1(input)?;
    let (input, session_version) = map_res(digit1, |s: &str| s.parse::<u64>())(input)?;
    let (input, _) = space1(input)?;
    let (input, net_type) = token(input)?;
    let (input, _) = space1(input)?;
    let (input, addr_type) = token(input)?;
    let (input, _) = space1(input)?;
    let (input, address) = token(input)?;

    Ok((
        input,
        Origin {
            username: username.to_string(),
            session_id: session_id.to_string(),
            session_version,
            net_type: net_type.to_string(),
            addr_type: addr_type.to_string(),
            address: address.to_string(),
        },
    ))
}

/// Replace escaped `\r\n` placeholders with real CRLF line breaks
pub fn unescape_line_breaks(text: &str) -> String {
    text.replace(ESCAPED_CRLF, "\r\n")
}

/// Replace real line breaks with the escaped placeholder, for single-line transport
pub fn escape_line_breaks(text: &str) -> String {
    text.replace("\r\n", ESCAPED_CRLF).replace('\n', ESCAPED_CRLF)
}

/// Split SDP text into lines, accepting CRLF, bare LF and the escaped placeholder
pub fn split_lines(text: &str) -> Vec<String> {
    unescape_line_breaks(text)
        .split('\n')
        .map(|line| line.trim_end().to_string())
        .filter(|line| !line.is_empty())
        .collect()
}

/// Parse a complete session description
pub fn parse_session_description(text: &str) -> Result<SessionDescription> {
    let mut version = None;
    let mut origin = None;
    let mut session_name = None;
    let mut session_lines = Vec::new();
    let mut media: Vec<MediaSection> = Vec::new();

    for (number, raw) in split_lines(text).iter().enumerate() {
        let (_, (key, value)) = all_consuming(parse_sdp_line)(raw.as_str())
            .map_err(|_| Error::parse(format!("line {} is not <type>=<value>: '{}'", number + 1, raw)))?;

        if key == 'm' {
            let (_, line) = all_consuming(parse_media_line)(value)
                .map_err(|e| Error::parse(format!("invalid m= line '{}': {}", value, e)))?;
            media.push(MediaSection::from_media_line(&line));
            continue;
        }

        if let Some(section) = media.last_mut() {
            section.lines.push(SdpLine::new(key, value));
            continue;
        }

        match key {
            'v' => {
                if version.is_some() {
                    return Err(Error::parse("duplicate v= line"));
                }
                if value != "0" {
                    return Err(Error::parse(format!("unsupported SDP version: {}", value)));
                }
                version = Some(0u8);
            }
            'o' => {
                if origin.is_some() {
                    return Err(Error::parse("duplicate o= line"));
                }
                let (_, parsed) = all_consuming(parse_origin_line)(value)
                    .map_err(|e| Error::parse(format!("invalid o= line '{}': {}", value, e)))?;
                origin = Some(parsed);
            }
            's' => {
                if session_name.is_some() {
                    return Err(Error::parse("duplicate s= line"));
                }
                session_name = Some(value.to_string());
            }
            _ => session_lines.push(SdpLine::new(key, value)),
        }
    }

    let version = version.ok_or_else(|| Error::parse("missing v= line"))?;
    let origin = origin.ok_or_else(|| Error::parse("missing o= line"))?;
    let session_name = session_name.ok_or_else(|| Error::parse("missing s= line"))?;
    if media.is_empty() {
        return Err(Error::parse("description has no m= section"));
    }

    Ok(SessionDescription {
        version,
        origin,
        session_name,
        session_lines,
        media,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sdp_line() {
        let (_, (key, value)) = parse_sdp_line("v=0").unwrap();
        assert_eq!(key, 'v');
        assert_eq!(value, "0");

        // Values may contain further equals signs
        let (_, (key, value)) = parse_sdp_line("a=fmtp:111 minptime=10;useinbandfec=1").unwrap();
        assert_eq!(key, 'a');
        assert_eq!(value, "fmtp:111 minptime=10;useinbandfec=1");

        assert!(parse_sdp_line("V=0").is_err());
        assert!(parse_sdp_line("a:b").is_err());
    }

    #[test]
    fn test_parse_media_line() {
        let (rest, line) = parse_media_line("audio 9 UDP/TLS/RTP/SAVPF 111 0 8").unwrap();
        assert!(rest.is_empty());
        assert_eq!(line.media, "audio");
        assert_eq!(line.port, 9);
        assert_eq!(line.port_count, None);
        assert_eq!(line.protocol, "UDP/TLS/RTP/SAVPF");
        assert_eq!(line.formats, vec!["111", "0", "8"]);

        let (_, line) = parse_media_line("video 49170/2 RTP/AVP 31").unwrap();
        assert_eq!(line.port_count, Some(2));

        assert!(all_consuming(parse_media_line)("audio nine RTP/AVP 0").is_err());
        assert!(all_consuming(parse_media_line)("audio 9 RTP/AVP").is_err());
    }

    #[test]
    fn test_parse_origin_line() {
        let (_, origin) = parse_origin_line("- 4611731400430051336 2 IN IP4 127.0.0.1").unwrap();
        assert_eq!(origin.username, "-");
        assert_eq!(origin.session_id, "4611731400430051336");
        assert_eq!(origin.session_version, 2);
        assert_eq!(origin.address, "127.0.0.1");

        assert!(all_consuming(parse_origin_line)("- 1 x IN IP4 127.0.0.1").is_err());
    }

    #[test]
    fn test_split_lines_accepts_all_line_break_forms() {
        let expected = vec!["v=0".to_string(), "s=-".to_string()];
        assert_eq!(split_lines("v=0\r\ns=-\r\n"), expected);
        assert_eq!(split_lines("v=0\ns=-\n"), expected);
        assert_eq!(split_lines("v=0\\r\\ns=-\\r\\n"), expected);
    }

    #[test]
    fn test_escape_round_trip() {
        let text = "v=0\r\no=- 1 1 IN IP4 0.0.0.0\r\n";
        let escaped = escape_line_breaks(text);
        assert!(!escaped.contains('\r'));
        assert_eq!(unescape_line_breaks(&escaped), text);
    }

    #[test]
    fn test_required_lines() {
        let body = "m=audio 9 RTP/AVP 0\r\n";
        assert!(parse_session_description(&format!("o=- 1 1 IN IP4 0.0.0.0\r\ns=-\r\n{}", body)).is_err());
        assert!(parse_session_description(&format!("v=0\r\ns=-\r\n{}", body)).is_err());
        assert!(parse_session_description(&format!("v=0\r\no=- 1 1 IN IP4 0.0.0.0\r\n{}", body)).is_err());
        assert!(parse_session_description("v=0\r\no=- 1 1 IN IP4 0.0.0.0\r\ns=-\r\n").is_err());
        assert!(parse_session_description(&format!("v=0\r\no=- 1 1 IN IP4 0.0.0.0\r\ns=-\r\n{}", body)).is_ok());
    }

    #[test]
    fn test_lines_after_m_belong_to_the_section() {
        let sdp = "v=0\r\no=- 1 1 IN IP4 0.0.0.0\r\ns=-\r\nt=0 0\r\na=group:BUNDLE 0\r\nm=audio 9 RTP/AVP 0\r\na=mid:0\r\na=sendonly\r\n";
        let description = parse_session_description(sdp).unwrap();
        assert_eq!(description.session_lines.len(), 2);
        assert_eq!(description.media.len(), 1);
        assert_eq!(description.media[0].lines.len(), 2);
    }
}
