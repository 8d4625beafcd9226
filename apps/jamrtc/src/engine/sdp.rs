use janus_proto::TrickleCandidate;

/// Candidate attributes embedded in a session description, in document order.
///
/// Each carries the index of the media section it appeared under. Lines ahead
/// of the first `m=` line are attributed to section 0.
pub fn inlined_candidates(sdp: &str) -> Vec<TrickleCandidate> {
    let mut candidates = Vec::new();
    let mut section: Option<u16> = None;
    for line in sdp.lines() {
        let line = line.trim_end_matches('\r');
        if line.starts_with("m=") {
            section = Some(section.map_or(0, |index| index + 1));
        } else if let Some(candidate) = line.strip_prefix("a=") {
            if candidate.starts_with("candidate:") {
                candidates.push(TrickleCandidate {
                    candidate: candidate.to_string(),
                    sdp_mline_index: section.unwrap_or(0),
                });
            }
        }
    }
    candidates
}

/// Rewrite a zero audio port to the discard port so the relay accepts it.
pub fn fix_zero_audio_port(sdp: &str) -> String {
    let mut fixed = String::with_capacity(sdp.len());
    let mut rest = sdp;
    while let Some(line_end) = rest.find('\n') {
        let (line, tail) = rest.split_at(line_end + 1);
        fixed.push_str(&rewrite_line(line));
        rest = tail;
    }
    fixed.push_str(&rewrite_line(rest));
    fixed
}

fn rewrite_line(line: &str) -> std::borrow::Cow<'_, str> {
    match line.strip_prefix("m=audio 0 ") {
        Some(tail) => format!("m=audio 9 {tail}").into(),
        None => line.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OFFER: &str = "v=0\r\n\
o=- 1 1 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
a=mid:0\r\n\
a=candidate:1 1 udp 2013266431 10.0.0.5 40000 typ host\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
a=mid:1\r\n\
a=candidate:2 1 udp 2013266431 10.0.0.5 40002 typ host\r\n";

    #[test]
    fn candidates_keep_order_and_section() {
        let candidates = inlined_candidates(OFFER);
        assert_eq!(candidates.len(), 2);
        assert_eq!(
            candidates[0].candidate,
            "candidate:1 1 udp 2013266431 10.0.0.5 40000 typ host"
        );
        assert_eq!(candidates[0].sdp_mline_index, 0);
        assert_eq!(candidates[1].sdp_mline_index, 1);
    }

    #[test]
    fn description_without_candidates_yields_none() {
        assert!(inlined_candidates("v=0\r\nm=audio 9 RTP/AVP 0\r\na=rtpmap:0 PCMU/8000\r\n").is_empty());
    }

    #[test]
    fn zero_audio_port_is_rewritten() {
        let sdp = "v=0\r\nm=audio 0 UDP/TLS/RTP/SAVPF 111\r\nm=video 0 UDP/TLS/RTP/SAVPF 96\r\n";
        let fixed = fix_zero_audio_port(sdp);
        assert_eq!(
            fixed,
            "v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\nm=video 0 UDP/TLS/RTP/SAVPF 96\r\n"
        );
        assert_eq!(fix_zero_audio_port(OFFER), OFFER);
    }
}
