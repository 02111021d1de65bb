#![allow(clippy::type_complexity)]

pub mod cancellation;
pub mod context;
pub mod firewall;
pub mod network;
pub mod pcap_exporter;
pub mod routing;
pub mod stack;
pub mod switch;
pub mod task_group;
pub mod tracing;
pub mod wire;

#[cfg(test)]
mod test {
    use crate::firewall::{FirewallAction, FirewallConfig, FirewallProtocol, FirewallRule};
    use crate::network::Network;
    use crate::network::frame::{FrameKind, UnreachableCode};
    use crate::network::ip::Ipv4Cidr;
    use crate::network::mac::MacAddress;
    use crate::network::nic::NicAddressing;
    use crate::network::spec::{
        CableSpec, EndpointSpec, InterfaceSpec, NetworkSpec, NodeKind, NodeSpec,
    };
    use crate::pcap_exporter::NoOpPcapExporterFactory;
    use crate::routing::{Route, RouteSource};
    use crate::stack::StackConfig;
    use crate::stack::arp::ArpError;
    use crate::stack::dhcp::{DhcpReservation, DhcpServerConfig};
    use crate::stack::icmp::{PingError, PingOptions};
    use crate::stack::ip::IpError;
    use crate::stack::tcp::TcpError;
    use crate::stack::udp::UdpError;
    use crate::tracing::simulation_step::{DatagramDropReason, FrameDropReason};
    use crate::tracing::simulation_stepper::SimulationStepper;
    use crate::tracing::tracer::SimulationStepTracer;
    use bon::builder;
    use fastrand::Rng;
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::sync::Arc;
    use std::time::Duration;
    use uuid::Uuid;

    const A_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 1, 10);
    const B_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 2, 10);
    const ROUTER_LAN1: Ipv4Addr = Ipv4Addr::new(10, 0, 1, 1);
    const ROUTER_LAN2: Ipv4Addr = Ipv4Addr::new(10, 0, 2, 1);
    const MAC_B: MacAddress = MacAddress([2, 0, 0, 0, 0, 0xb]);

    fn cidr(s: &str) -> Ipv4Cidr {
        s.parse().unwrap()
    }

    fn cable(id: &str, a: (&str, usize), b: (&str, usize)) -> CableSpec {
        CableSpec {
            id: id.to_string(),
            a: EndpointSpec::new(a.0, a.1),
            b: EndpointSpec::new(b.0, b.1),
            delay: Duration::from_millis(10),
        }
    }

    fn initialize(nodes: Vec<NodeSpec>, cables: Vec<CableSpec>) -> Arc<Network> {
        let spec = NetworkSpec {
            nodes,
            cables,
            config: StackConfig::default(),
        };
        let tracer = Arc::new(SimulationStepTracer::new(Arc::new(NoOpPcapExporterFactory)));
        Network::initialize(spec, tracer, Rng::with_seed(42)).unwrap()
    }

    /// Host A - Switch - Router - Switch - Host B, with 10ms cables
    ///
    /// With `dhcp`, B and an extra host C obtain their addresses from the router.
    #[builder]
    fn two_subnets(
        #[builder(default)] firewall: FirewallConfig,
        #[builder(default)] dhcp: bool,
    ) -> Arc<Network> {
        let a = NodeSpec::new("a", NodeKind::Host)
            .with_interface(InterfaceSpec::with_address(cidr("10.0.1.10/24")).gateway(ROUTER_LAN1));
        let b = if dhcp {
            InterfaceSpec {
                mac: Some(MAC_B),
                ..InterfaceSpec::dhcp()
            }
        } else {
            InterfaceSpec::with_address(cidr("10.0.2.10/24")).gateway(ROUTER_LAN2)
        };
        let b = NodeSpec::new("b", NodeKind::Host).with_interface(b);

        let mut router = NodeSpec::new("r", NodeKind::Router)
            .with_interface(InterfaceSpec::with_address(cidr("10.0.1.1/24")))
            .with_interface(InterfaceSpec::with_address(cidr("10.0.2.1/24")));
        router.firewall = firewall;

        let mut cables = vec![
            cable("a-sw1", ("a", 0), ("sw1", 0)),
            cable("sw1-r", ("sw1", 1), ("r", 0)),
            cable("r-sw2", ("r", 1), ("sw2", 0)),
            cable("sw2-b", ("sw2", 1), ("b", 0)),
        ];
        let mut extra_nodes = Vec::new();
        if dhcp {
            router.dhcp_server = Some(DhcpServerConfig {
                interface: 1,
                pool_start: Ipv4Addr::new(10, 0, 2, 100),
                pool_end: Ipv4Addr::new(10, 0, 2, 110),
                gateway: Some(ROUTER_LAN2),
                dns: None,
                reservations: vec![DhcpReservation {
                    mac: MAC_B,
                    ip: Ipv4Addr::new(10, 0, 2, 50),
                }],
            });
            extra_nodes.push(NodeSpec::new("c", NodeKind::Host).with_interface(InterfaceSpec::dhcp()));
            cables.push(cable("sw2-c", ("sw2", 2), ("c", 0)));
        }

        let mut nodes = vec![
            a,
            NodeSpec::switch("sw1", 4),
            router,
            NodeSpec::switch("sw2", 4),
            b,
        ];
        nodes.extend(extra_nodes);
        initialize(nodes, cables)
    }

    /// Three RIP routers in a line, each end with a stub network
    fn rip_line() -> Arc<Network> {
        let router = |id: &str, first: &str, second: &str| {
            let mut spec = NodeSpec::new(id, NodeKind::Router)
                .with_interface(InterfaceSpec::with_address(cidr(first)))
                .with_interface(InterfaceSpec::with_address(cidr(second)));
            spec.rip = true;
            spec
        };

        let r1 = router("r1", "10.0.1.1/24", "10.0.12.1/24").with_route(Route::manual(
            cidr("192.168.0.0/16"),
            Some(Ipv4Addr::new(10, 0, 12, 2)),
            Ipv4Addr::new(10, 0, 12, 1),
            5,
        ));
        let r2 = router("r2", "10.0.12.2/24", "10.0.23.2/24");
        let r3 = router("r3", "10.0.23.3/24", "10.0.3.1/24");

        initialize(
            vec![r1, r2, r3],
            vec![
                cable("r1-r2", ("r1", 1), ("r2", 0)),
                cable("r2-r3", ("r2", 1), ("r3", 0)),
            ],
        )
    }

    /// The ids of the nodes a frame visited
    fn frame_path(stepper: &SimulationStepper, frame: Uuid) -> Vec<String> {
        stepper
            .get_frame_path(frame)
            .iter()
            .map(|id| id.to_string())
            .collect()
    }

    fn echo_addr(ip: Ipv4Addr) -> SocketAddrV4 {
        SocketAddrV4::new(ip, 7)
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_across_router() {
        let network = two_subnets().call();
        network.start().await.unwrap();
        let a = network.ip_node("a").unwrap();

        let first = a.ping(B_IP, PingOptions::default()).await.unwrap();
        assert_eq!(first.responder, B_IP);
        assert!(first.round_trip > Duration::from_millis(80));

        // Four cables each way, no address resolution left to do
        let second = a.ping(B_IP, PingOptions::default()).await.unwrap();
        assert_eq!(second.round_trip, Duration::from_millis(80));
        assert_eq!(second.ttl, 63);

        // Both switches learned the stations on either side of them
        let router = network.ip_node("r").unwrap();
        let b = network.ip_node("b").unwrap();
        let mut sw1 = network.switch("sw1").unwrap().sat().snapshot();
        sw1.sort_by_key(|&(_, port)| port);
        assert_eq!(sw1, vec![(a.nics()[0].mac(), 0), (router.nics()[0].mac(), 1)]);
        let mut sw2 = network.switch("sw2").unwrap().sat().snapshot();
        sw2.sort_by_key(|&(_, port)| port);
        assert_eq!(sw2, vec![(router.nics()[1].mac(), 0), (b.nics()[0].mac(), 1)]);

        // The echo request goes through the first switch and ends at the router
        let stepper = network.tracer().stepper();
        let request = stepper.frames_sent_by("a", FrameKind::Icmp)[0];
        assert_eq!(frame_path(&stepper, request), ["a", "sw1", "r"]);

        network.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_switches_forward_known_unicast_to_a_single_port() {
        // C sits next to B on sw2
        let network = two_subnets().dhcp(true).call();
        network.start().await.unwrap();
        let a = network.ip_node("a").unwrap();
        let reserved = Ipv4Addr::new(10, 0, 2, 50);
        for _ in 0..2 {
            a.ping(reserved, PingOptions::default()).await.unwrap();
        }

        let stepper = network.tracer().stepper();

        // The router's ARP request is flooded, so C sees it too
        let arp_request = stepper.frames_sent_by("r", FrameKind::ArpRequest)[0];
        let flooded = frame_path(&stepper, arp_request);
        assert!(flooded.iter().any(|id| id == "b"));
        assert!(flooded.iter().any(|id| id == "c"));

        // Echo requests and replies only take the learned ports
        let icmp = stepper.frames_sent_by("r", FrameKind::Icmp);
        assert_eq!(icmp.len(), 4);
        for frame in icmp {
            let path = frame_path(&stepper, frame);
            assert_eq!(path.len(), 3);
            assert!(path == ["r", "sw2", "b"] || path == ["r", "sw1", "a"]);
        }

        network.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_arp_timeout_on_the_local_network() {
        let network = two_subnets().call();
        network.start().await.unwrap();
        let a = network.ip_node("a").unwrap();
        let absent = Ipv4Addr::new(10, 0, 1, 99);

        let start = tokio::time::Instant::now();
        let err = a.ping(absent, PingOptions::default()).await.unwrap_err();
        assert_eq!(
            err,
            PingError::Send(IpError::AddressResolution(
                ArpError::AddressResolutionTimeout(absent)
            ))
        );
        assert_eq!(start.elapsed(), Duration::from_secs(1));

        network.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_router_reports_unresolvable_host() {
        let network = two_subnets().call();
        network.start().await.unwrap();
        let a = network.ip_node("a").unwrap();

        let err = a
            .ping(Ipv4Addr::new(10, 0, 2, 99), PingOptions::default())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            PingError::Unreachable {
                from: ROUTER_LAN1,
                code: UnreachableCode::Host
            }
        );

        let stepper = network.tracer().stepper();
        let dropped = stepper.datagrams_dropped(DatagramDropReason::AddressResolution);
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].datagram.node_id.as_ref(), "r");

        network.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_pending_address_resolution() {
        let network = two_subnets().call();
        network.start().await.unwrap();
        let a = network.ip_node("a").unwrap().clone();

        let start = tokio::time::Instant::now();
        let ping = tokio::spawn(async move {
            a.ping(Ipv4Addr::new(10, 0, 1, 99), PingOptions::default())
                .await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        network.stop().await.unwrap();

        let err = ping.await.unwrap().unwrap_err();
        assert_eq!(
            err,
            PingError::Send(IpError::AddressResolution(ArpError::Cancelled))
        );
        // Well before the ARP timeout
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_modem_repeats_frames() {
        let network = initialize(
            vec![
                NodeSpec::new("a", NodeKind::Host)
                    .with_interface(InterfaceSpec::with_address(cidr("10.0.0.1/24"))),
                NodeSpec::new("m", NodeKind::Modem),
                NodeSpec::new("b", NodeKind::Host)
                    .with_interface(InterfaceSpec::with_address(cidr("10.0.0.2/24"))),
            ],
            vec![
                cable("a-m", ("a", 0), ("m", 0)),
                cable("m-b", ("m", 1), ("b", 0)),
            ],
        );
        network.start().await.unwrap();
        let a = network.ip_node("a").unwrap();
        let b_ip = Ipv4Addr::new(10, 0, 0, 2);

        a.ping(b_ip, PingOptions::default()).await.unwrap();
        let reply = a.ping(b_ip, PingOptions::default()).await.unwrap();
        assert_eq!(reply.round_trip, Duration::from_millis(40));
        // No routing involved
        assert_eq!(reply.ttl, 64);

        let stepper = network.tracer().stepper();
        let request = stepper.frames_sent_by("a", FrameKind::ArpRequest)[0];
        assert_eq!(frame_path(&stepper, request), ["a", "m", "b"]);
        let reply = stepper.frames_sent_by("b", FrameKind::Icmp)[0];
        assert_eq!(frame_path(&stepper, reply), ["b", "m", "a"]);

        network.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_speed_factor_changes_while_running() {
        let network = two_subnets().call();
        network.start().await.unwrap();
        let a = network.ip_node("a").unwrap();

        a.ping(B_IP, PingOptions::default()).await.unwrap();
        let normal = a.ping(B_IP, PingOptions::default()).await.unwrap();
        assert_eq!(normal.round_trip, Duration::from_millis(80));

        network.set_speed_factor(2.0).unwrap();
        let slow = a.ping(B_IP, PingOptions::default()).await.unwrap();
        assert_eq!(slow.round_trip, Duration::from_millis(160));

        network.set_speed_factor(0.5).unwrap();
        let fast = a.ping(B_IP, PingOptions::default()).await.unwrap();
        assert_eq!(fast.round_trip, Duration::from_millis(40));
        assert!(network.set_speed_factor(-1.0).is_err());

        network.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconfigured_nic_updates_auto_routes() {
        let network = two_subnets().call();
        let a = network.ip_node("a").unwrap();

        let addressing = NicAddressing {
            ip: Some(cidr("192.168.5.5/24")),
            gateway: None,
            dns: None,
        };
        a.configure_nic(0, addressing).unwrap();
        assert!(a.configure_nic(1, addressing).is_err());

        let routes = a.routing_table().snapshot();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].target, cidr("192.168.5.0/24"));
        assert_eq!(routes[0].source, RouteSource::Auto);

        let route = a.routing_table().best_route(Ipv4Addr::new(192, 168, 5, 7)).unwrap();
        assert_eq!(route.gateway, None);
        assert_eq!(route.interface, Ipv4Addr::new(192, 168, 5, 5));
        // The old default route is gone
        assert!(a.routing_table().best_route(B_IP).is_err());

        network.start().await.unwrap();
        assert_eq!(a.routing_table().snapshot(), routes);
        assert_eq!(a.nics()[0].ip(), Some(Ipv4Addr::new(192, 168, 5, 5)));
        network.stop().await.unwrap();
        assert_eq!(a.routing_table().snapshot(), routes);
    }

    #[tokio::test(start_paused = true)]
    async fn test_arp_requests_are_cached() {
        let network = two_subnets().call();
        network.start().await.unwrap();
        let a = network.ip_node("a").unwrap();

        for _ in 0..3 {
            a.ping(B_IP, PingOptions::default()).await.unwrap();
        }

        let stepper = network.tracer().stepper();
        assert_eq!(stepper.frames_sent_by("a", FrameKind::ArpRequest).len(), 1);
        assert_eq!(stepper.frames_sent_by("r", FrameKind::ArpRequest).len(), 1);
        // B learned the router's address from its request
        assert_eq!(stepper.frames_sent_by("b", FrameKind::ArpRequest).len(), 0);

        let stack = a.stack().unwrap();
        let cache = stack.arp_cache();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache[0].0, ROUTER_LAN1);

        network.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_exceeded_at_router() {
        let network = two_subnets().call();
        network.start().await.unwrap();
        let a = network.ip_node("a").unwrap();

        let options = PingOptions {
            ttl: 1,
            ..PingOptions::default()
        };
        let err = a.ping(B_IP, options).await.unwrap_err();
        assert_eq!(err, PingError::TimeExceeded { from: ROUTER_LAN1 });

        let stepper = network.tracer().stepper();
        let dropped = stepper.datagrams_dropped(DatagramDropReason::TtlExceeded);
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].datagram.node_id.as_ref(), "r");
        assert!(stepper.datagrams_delivered_to("b").is_empty());

        network.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_without_route() {
        let network = two_subnets().call();
        network.start().await.unwrap();
        let b = network.ip_node("b").unwrap();

        // The router has no route to 172.16.0.0/12
        let err = b
            .ping(Ipv4Addr::new(172, 16, 0, 1), PingOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PingError::Unreachable { from, .. } if from == ROUTER_LAN2));

        network.stop().await.unwrap();
        let err = b.ping(A_IP, PingOptions::default()).await.unwrap_err();
        assert_eq!(err, PingError::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tcp_echo_across_router() {
        let network = two_subnets().call();
        network.start().await.unwrap();
        let a = network.ip_node("a").unwrap();
        let b = network.ip_node("b").unwrap();

        let mut listener = b
            .tcp_listen(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 7))
            .unwrap();
        let server = tokio::spawn(async move {
            let mut stream = listener.accept().await.unwrap();
            let request = stream.read_to_end().await.unwrap();
            stream.write(request).unwrap();
            stream.close();
            stream.closed().await.unwrap();
        });

        // Large enough to need several segments
        let payload: Vec<u8> = (0..2000u32).map(|i| i as u8).collect();
        let mut client = a.tcp_connect(echo_addr(B_IP)).await.unwrap();
        assert_eq!(*client.local_addr().ip(), A_IP);
        client.write(payload.clone()).unwrap();
        client.close();

        let echoed = client.read_to_end().await.unwrap();
        assert_eq!(echoed, payload);
        client.closed().await.unwrap();
        server.await.unwrap();

        network.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_tcp_retransmits_lost_segment() {
        let network = two_subnets().call();
        network.start().await.unwrap();
        let a = network.ip_node("a").unwrap();
        let b = network.ip_node("b").unwrap();

        let mut listener = b.tcp_listen(echo_addr(B_IP)).unwrap();
        let mut client = a.tcp_connect(echo_addr(B_IP)).await.unwrap();
        let mut server = listener.accept().await.unwrap();

        let cable = network.cable("sw2-b").unwrap();
        cable.set_blocked(true);
        client.write(b"hello".to_vec()).unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        cable.set_blocked(false);

        let received = server.read_exact(5).await.unwrap();
        assert_eq!(received, b"hello");

        let stepper = network.tracer().stepper();
        assert_eq!(stepper.frames_dropped(FrameDropReason::CableBlocked).len(), 1);

        network.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_tcp_fails_after_retry_exhaustion() {
        let network = two_subnets().call();
        network.start().await.unwrap();
        let a = network.ip_node("a").unwrap();
        let b = network.ip_node("b").unwrap();

        let mut listener = b.tcp_listen(echo_addr(B_IP)).unwrap();
        let mut client = a.tcp_connect(echo_addr(B_IP)).await.unwrap();
        let _server = listener.accept().await.unwrap();

        network.cable("sw2-b").unwrap().set_blocked(true);
        client.write(b"lost".to_vec()).unwrap();

        assert_eq!(client.closed().await, Err(TcpError::ConnectionFailed));
        assert_eq!(client.read().await, Err(TcpError::ConnectionFailed));

        network.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_tcp_connection_refused() {
        let network = two_subnets().call();
        network.start().await.unwrap();
        let a = network.ip_node("a").unwrap();

        let result = a.tcp_connect(SocketAddrV4::new(B_IP, 9)).await;
        assert_eq!(result.err(), Some(TcpError::ConnectionRefused));

        let stepper = network.tracer().stepper();
        let dropped = stepper.datagrams_dropped(DatagramDropReason::PortUnreachable);
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].datagram.node_id.as_ref(), "b");

        network.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_connections_release_their_tasks() {
        let network = two_subnets().call();
        network.start().await.unwrap();
        let a = network.ip_node("a").unwrap();
        let b = network.ip_node("b").unwrap();
        let a_stack = a.stack().unwrap();
        let b_stack = b.stack().unwrap();
        let initial = (a_stack.task_count(), b_stack.task_count());

        let mut listener = b.tcp_listen(echo_addr(B_IP)).unwrap();
        for _ in 0..50 {
            let mut client = a.tcp_connect(echo_addr(B_IP)).await.unwrap();
            let mut server = listener.accept().await.unwrap();
            client.close();
            assert!(server.read_to_end().await.unwrap().is_empty());
            server.close();
            client.closed().await.unwrap();
            server.closed().await.unwrap();

            // Outlive TIME-WAIT
            tokio::time::sleep(Duration::from_secs(3)).await;
        }

        // At most the handle of the last, already finished, connection is left
        assert!(a_stack.task_count() <= initial.0 + 1);
        assert!(b_stack.task_count() <= initial.1 + 1);

        network.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_udp_delivery_and_silent_drop() {
        let network = two_subnets().call();
        network.start().await.unwrap();
        let a = network.ip_node("a").unwrap();
        let b = network.ip_node("b").unwrap();

        let mut server = b
            .udp_bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 5000))
            .unwrap();
        let client = a
            .udp_bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))
            .unwrap();

        client
            .send_to(SocketAddrV4::new(B_IP, 5000), b"hi".to_vec())
            .await
            .unwrap();
        let packet = server.recv().await.unwrap();
        assert_eq!(packet.data, b"hi");
        assert_eq!(packet.source, SocketAddrV4::new(A_IP, client.local_addr().port()));

        client
            .send_to(SocketAddrV4::new(B_IP, 5001), b"lost".to_vec())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let stepper = network.tracer().stepper();
        let dropped = stepper.datagrams_dropped(DatagramDropReason::PortUnreachable);
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].datagram.node_id.as_ref(), "b");

        assert_eq!(
            client.send_broadcast_on(3, 5000, b"nowhere".to_vec()).await,
            Err(UdpError::NoSuchInterface(3))
        );

        network.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_rip_convergence_and_expiry() {
        let network = rip_line();
        network.start().await.unwrap();
        let r1 = network.ip_node("r1").unwrap();
        let far_away = Ipv4Addr::new(10, 0, 3, 7);

        // Two beacon intervals are enough for a two-hop propagation
        tokio::time::sleep(Duration::from_secs(65)).await;
        let route = r1.routing_table().best_route(far_away).unwrap();
        assert_eq!(route.source, RouteSource::Rip);
        assert_eq!(route.target, cidr("10.0.3.0/24"));
        assert_eq!(route.gateway, Some(Ipv4Addr::new(10, 0, 12, 2)));
        assert_eq!(route.interface, Ipv4Addr::new(10, 0, 12, 1));
        assert_eq!(route.metric, 2);

        let reply = r1
            .ping(Ipv4Addr::new(10, 0, 3, 1), PingOptions::default())
            .await
            .unwrap();
        assert_eq!(reply.responder, Ipv4Addr::new(10, 0, 3, 1));

        // Without refreshes, the route times out at r2 first and then at r1
        network.cable("r2-r3").unwrap().set_blocked(true);
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert!(r1.routing_table().best_route(far_away).is_err());
        assert!(r1.routing_table().best_route(Ipv4Addr::new(10, 0, 23, 9)).is_ok());

        network.stop().await.unwrap();
        assert!(r1.routing_table().rip_routes().is_empty());
        assert_eq!(r1.routing_table().manual_routes().len(), 1);
        assert_eq!(
            r1.routing_table().best_route(Ipv4Addr::new(192, 168, 3, 3)).map(|r| r.source),
            Ok(RouteSource::Manual)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_firewall_rule_order_and_icmp_toggle() {
        let firewall = FirewallConfig {
            enabled: true,
            rules: vec![
                FirewallRule {
                    source: Ipv4Cidr::DEFAULT_ROUTE,
                    destination: cidr("10.0.2.10/32"),
                    protocol: FirewallProtocol::Tcp,
                    port: Some(7),
                    action: FirewallAction::Drop,
                },
                FirewallRule {
                    source: Ipv4Cidr::DEFAULT_ROUTE,
                    destination: Ipv4Cidr::DEFAULT_ROUTE,
                    protocol: FirewallProtocol::Any,
                    port: None,
                    action: FirewallAction::Accept,
                },
            ],
            default_action: FirewallAction::Drop,
            syn_only: false,
            drop_icmp: false,
        };
        let network = two_subnets().firewall(firewall).call();
        network.start().await.unwrap();
        let a = network.ip_node("a").unwrap();
        let b = network.ip_node("b").unwrap();
        let router_firewall = network.ip_node("r").unwrap().firewall().clone();

        let mut listener = b.tcp_listen(echo_addr(B_IP)).unwrap();
        let result = a.tcp_connect(echo_addr(B_IP)).await;
        assert_eq!(result.err(), Some(TcpError::ConnectionFailed));
        let stepper = network.tracer().stepper();
        assert!(!stepper.datagrams_dropped(DatagramDropReason::Firewall).is_empty());

        // Everything else is accepted
        a.ping(B_IP, PingOptions::default()).await.unwrap();

        router_firewall.remove_rule(0).unwrap();
        let _client = a.tcp_connect(echo_addr(B_IP)).await.unwrap();
        let _server = listener.accept().await.unwrap();

        router_firewall.set_drop_icmp(true);
        let err = a.ping(B_IP, PingOptions::default()).await.unwrap_err();
        assert_eq!(err, PingError::Timeout);

        network.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_firewall_syn_only() {
        let firewall = FirewallConfig {
            enabled: true,
            rules: vec![FirewallRule {
                source: cidr("10.0.1.0/24"),
                destination: Ipv4Cidr::DEFAULT_ROUTE,
                protocol: FirewallProtocol::Tcp,
                port: None,
                action: FirewallAction::Accept,
            }],
            default_action: FirewallAction::Drop,
            syn_only: true,
            drop_icmp: false,
        };
        let network = two_subnets().firewall(firewall).call();
        network.start().await.unwrap();
        let a = network.ip_node("a").unwrap();
        let b = network.ip_node("b").unwrap();

        // The answers of B only pass because they belong to a flow A opened
        let mut listener = b.tcp_listen(echo_addr(B_IP)).unwrap();
        let mut client = a.tcp_connect(echo_addr(B_IP)).await.unwrap();
        let mut server = listener.accept().await.unwrap();
        server.write(b"welcome".to_vec()).unwrap();
        assert_eq!(client.read_exact(7).await.unwrap(), b"welcome");

        // Anything B starts on its own is dropped
        let socket = b
            .udp_bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))
            .unwrap();
        socket
            .send_to(SocketAddrV4::new(A_IP, 5000), b"hello?".to_vec())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let stepper = network.tracer().stepper();
        let dropped = stepper.datagrams_dropped(DatagramDropReason::Firewall);
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].datagram.source, B_IP);

        network.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_dhcp_assigns_reserved_and_pool_addresses() {
        let network = two_subnets().dhcp(true).call();
        network.start().await.unwrap();
        let a = network.ip_node("a").unwrap();
        let b = network.ip_node("b").unwrap();
        let c = network.ip_node("c").unwrap();

        let reserved = Ipv4Addr::new(10, 0, 2, 50);
        assert_eq!(b.nics()[0].ip(), Some(reserved));
        assert_eq!(b.nics()[0].addressing().gateway, Some(ROUTER_LAN2));
        assert_eq!(c.nics()[0].ip(), Some(Ipv4Addr::new(10, 0, 2, 100)));

        let reply = a.ping(reserved, PingOptions::default()).await.unwrap();
        assert_eq!(reply.responder, reserved);

        network.stop().await.unwrap();
        assert_eq!(b.nics()[0].ip(), None);
        assert_eq!(b.nics()[0].configured_addressing().ip, None);
    }
}
