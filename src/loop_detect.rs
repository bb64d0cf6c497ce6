use std::net::IpAddr;

/// Detects a reverse-proxy loop: the request's origin was not changed by
/// any plugin, and the IP it would resolve to is one of this process's own
/// listening addresses — proxying a request back to ourselves would
/// otherwise spin forever.
pub fn is_reverse_proxy_loop(
    outbound_origin: &str,
    inbound_origin: &str,
    resolved_ip: IpAddr,
    local_addresses: &[IpAddr],
) -> bool {
    if outbound_origin.is_empty() || outbound_origin != inbound_origin {
        return false;
    }
    local_addresses.contains(&resolved_ip)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn detects_loop_when_origin_unchanged_and_ip_is_local() {
        let local = [IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))];
        assert!(is_reverse_proxy_loop(
            "example.com",
            "example.com",
            IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            &local,
        ));
    }

    #[test]
    fn no_loop_when_origin_was_redirected() {
        let local = [IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))];
        assert!(!is_reverse_proxy_loop(
            "other.example.com",
            "example.com",
            IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            &local,
        ));
    }

    #[test]
    fn no_loop_when_ip_is_remote() {
        let local = [IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))];
        assert!(!is_reverse_proxy_loop(
            "example.com",
            "example.com",
            IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)),
            &local,
        ));
    }
}
