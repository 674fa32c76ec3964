//! Captive-portal DNS responder.
//!
//! Every query is answered with an A record pointing at the portal gateway,
//! regardless of the queried name. Phones probing for connectivity resolve
//! everything to the portal and open the configuration page.
//!
//! Only the answer construction lives here; the UDP socket is owned by the
//! portal's cooperative loop.

/// Minimum length of a DNS message (fixed header).
const DNS_HEADER_LEN: usize = 12;

/// Answer TTL in seconds.
const ANSWER_TTL: [u8; 4] = [0x00, 0x00, 0x00, 0x3c];

/// Build a DNS response resolving the query to `gateway`.
///
/// The response echoes the transaction ID and question section, mirrors the
/// question count as the answer count, and appends a single A record via a
/// compression pointer to the first question name. Returns `None` for a
/// datagram too short to be a DNS query.
pub fn build_response(query: &[u8], gateway: [u8; 4]) -> Option<Vec<u8>> {
    if query.len() < DNS_HEADER_LEN {
        return None;
    }

    let mut response = Vec::with_capacity(query.len() + 16);
    response.extend_from_slice(&query[..2]); // transaction ID
    response.extend_from_slice(&[0x81, 0x80]); // standard response, no error
    response.extend_from_slice(&query[4..6]); // question count
    response.extend_from_slice(&query[4..6]); // answer count mirrors questions
    response.extend_from_slice(&[0x00, 0x00]); // authority RRs
    response.extend_from_slice(&[0x00, 0x00]); // additional RRs
    response.extend_from_slice(&query[DNS_HEADER_LEN..]); // question section
    response.extend_from_slice(&[0xc0, 0x0c]); // pointer to question name
    response.extend_from_slice(&[0x00, 0x01]); // type A
    response.extend_from_slice(&[0x00, 0x01]); // class IN
    response.extend_from_slice(&ANSWER_TTL);
    response.extend_from_slice(&[0x00, 0x04]); // rdata length
    response.extend_from_slice(&gateway);
    Some(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    const GATEWAY: [u8; 4] = [192, 168, 4, 1];

    /// A query for `example.com`, type A, class IN.
    fn example_query() -> Vec<u8> {
        let mut query = vec![
            0xab, 0xcd, // transaction ID
            0x01, 0x00, // standard query, recursion desired
            0x00, 0x01, // one question
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        ];
        query.extend_from_slice(b"\x07example\x03com\x00");
        query.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]);
        query
    }

    #[test]
    fn test_response_echoes_transaction_id() {
        let response = build_response(&example_query(), GATEWAY).unwrap();
        assert_eq!(&response[..2], &[0xab, 0xcd]);
    }

    #[test]
    fn test_response_flags_and_counts() {
        let response = build_response(&example_query(), GATEWAY).unwrap();
        assert_eq!(&response[2..4], &[0x81, 0x80]);
        assert_eq!(&response[4..6], &[0x00, 0x01]); // questions
        assert_eq!(&response[6..8], &[0x00, 0x01]); // answers
        assert_eq!(&response[8..12], &[0x00, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_response_answer_points_at_gateway() {
        let query = example_query();
        let response = build_response(&query, GATEWAY).unwrap();

        // Question section echoed verbatim after the header.
        let question = &query[12..];
        assert_eq!(&response[12..12 + question.len()], question);

        // Answer record: name pointer, type A, class IN, TTL, rdlength, IP.
        let answer = &response[12 + question.len()..];
        assert_eq!(&answer[..2], &[0xc0, 0x0c]);
        assert_eq!(&answer[2..4], &[0x00, 0x01]);
        assert_eq!(&answer[4..6], &[0x00, 0x01]);
        assert_eq!(&answer[10..12], &[0x00, 0x04]);
        assert_eq!(&answer[12..16], &GATEWAY);
    }

    #[test]
    fn test_any_name_resolves_to_gateway() {
        let mut query = example_query();
        // Rewrite the name to a different host; answer must not change.
        query.truncate(12);
        query.extend_from_slice(b"\x0cconnectivity\x05check\x00");
        query.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]);

        let response = build_response(&query, GATEWAY).unwrap();
        assert_eq!(&response[response.len() - 4..], &GATEWAY);
    }

    #[test]
    fn test_truncated_datagram_is_ignored() {
        assert!(build_response(&[0x01, 0x02, 0x03], GATEWAY).is_none());
    }
}
