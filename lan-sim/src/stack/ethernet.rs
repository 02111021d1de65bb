use crate::network::frame::{Frame, FramePayload};
use crate::network::mac::MacAddress;
use crate::network::nic::NetworkInterface;
use crate::stack::ProtocolStack;
use crate::stack::ip::InboundDatagram;
use std::sync::Arc;

/// Reads the frames arriving at the interface's port until the stack stops
pub(crate) async fn receive_frames(stack: Arc<ProtocolStack>, nic: Arc<NetworkInterface>) {
    let token = stack.token().clone();
    while let Some(frames) = token.run_until_cancelled(nic.port().next_frames()).await {
        for frame in frames {
            stack.handle_frame(&nic, frame);
        }
    }
}

impl ProtocolStack {
    pub(crate) fn send_frame(
        &self,
        nic: &NetworkInterface,
        destination: MacAddress,
        payload: FramePayload,
    ) {
        let frame = self.context.frame(nic.mac(), destination, payload);
        nic.port().send(frame);
    }

    fn handle_frame(&self, nic: &NetworkInterface, frame: Frame) {
        self.context.tracer.track_frame_received(&self.node_id, &frame);
        if frame.destination != nic.mac() && !frame.destination.is_broadcast() {
            self.context
                .tracer
                .track_frame_not_addressed(&self.node_id, &frame);
            return;
        }

        match frame.payload {
            FramePayload::Arp(packet) => self.handle_arp(nic, packet),
            FramePayload::Ipv4(datagram) => {
                // The receiver is gone only while stopping
                self.ip_input
                    .send(InboundDatagram {
                        nic_index: Some(nic.index()),
                        datagram,
                    })
                    .ok();
            }
        }
    }
}
