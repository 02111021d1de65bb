use crate::network::frame::Frame;
use crate::wire;
use anyhow::Context;
use parking_lot::Mutex;
use pcap_file::pcapng::PcapNgWriter;
use pcap_file::pcapng::blocks::enhanced_packet::EnhancedPacketBlock;
use pcap_file::pcapng::blocks::interface_description::InterfaceDescriptionBlock;
use pcap_file::pcapng::blocks::section_header::SectionHeaderBlock;
use pcap_file::{DataLink, Endianness};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

pub trait PcapExporterFactory: Send + Sync {
    fn create_pcap_exporter_for_node(&self, node_id: &str) -> anyhow::Result<PcapExporter>;
}

pub struct NoOpPcapExporterFactory;
impl PcapExporterFactory for NoOpPcapExporterFactory {
    fn create_pcap_exporter_for_node(&self, _: &str) -> anyhow::Result<PcapExporter> {
        Ok(PcapExporter::noop())
    }
}

/// Writes one `<node_id>.pcap` file per node, inside `directory`
pub struct FileBasedPcapExporterFactory {
    pub directory: PathBuf,
}

impl PcapExporterFactory for FileBasedPcapExporterFactory {
    fn create_pcap_exporter_for_node(&self, node_id: &str) -> anyhow::Result<PcapExporter> {
        let path = self.directory.join(format!("{node_id}.pcap"));
        let pcap_file = fs::File::create(&path)
            .with_context(|| format!("failed to open {} for writing", path.display()))?;
        PcapExporter::new(pcap_file)
    }
}

type Writer = PcapNgWriter<BufWriter<Box<dyn Write + Send + Sync + 'static>>>;

/// Captures the frames seen by a single node as an Ethernet pcapng stream
pub struct PcapExporter {
    capture_start: Instant,
    total_tracked_frames: AtomicU64,
    writer: Option<Mutex<Writer>>,
}

impl PcapExporter {
    pub fn new(writer: impl Write + Send + Sync + 'static) -> anyhow::Result<Self> {
        let writer: Box<dyn Write + Send + Sync + 'static> = Box::new(writer);
        let mut writer = PcapNgWriter::with_section_header(
            BufWriter::new(writer),
            SectionHeaderBlock {
                endianness: Endianness::Big,
                major_version: 1,
                minor_version: 0,
                section_length: 0,
                options: vec![],
            },
        )
        .context("failed to write pcapng section header")?;

        writer
            .write_pcapng_block(InterfaceDescriptionBlock {
                linktype: DataLink::ETHERNET,
                snaplen: 65535,
                options: vec![],
            })
            .context("failed to write pcapng interface description")?;

        Ok(Self {
            capture_start: Instant::now(),
            total_tracked_frames: AtomicU64::new(0),
            writer: Some(Mutex::new(writer)),
        })
    }

    pub fn noop() -> Self {
        Self {
            capture_start: Instant::now(),
            total_tracked_frames: AtomicU64::new(0),
            writer: None,
        }
    }

    pub fn total_tracked_frames(&self) -> u64 {
        self.total_tracked_frames.load(Ordering::Relaxed)
    }

    pub fn flush(&self) -> anyhow::Result<()> {
        let Some(writer) = &self.writer else {
            return Ok(());
        };

        writer
            .lock()
            .get_mut()
            .flush()
            .context("failed to flush pcap writer")
    }

    pub fn track_frame(&self, frame: &Frame) -> anyhow::Result<()> {
        self.total_tracked_frames.fetch_add(1, Ordering::Relaxed);
        let Some(writer) = &self.writer else {
            return Ok(());
        };

        let data = wire::encode_frame(frame)
            .with_context(|| format!("failed to encode frame #{}", frame.number))?;

        writer
            .lock()
            .write_pcapng_block(EnhancedPacketBlock {
                interface_id: 0,
                timestamp: correct_timestamp(self.capture_start.elapsed()),
                original_len: data.len() as u32,
                data: data.into(),
                options: Vec::new(),
            })
            .context("failed to write frame to pcap")?;

        Ok(())
    }
}

fn correct_timestamp(d: Duration) -> Duration {
    // Round to the nearest millisecond
    let millis = (d.as_secs_f64() * 1000.0).round();

    // Return the time, an order of magnitude smaller (the pcapng writer multiplies seconds by
    // 1000)
    Duration::from_secs_f64(millis / 1_000_000.0)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::network::frame::{ArpOperation, ArpPacket, FramePayload};
    use crate::network::mac::MacAddress;
    use std::net::Ipv4Addr;
    use std::sync::Arc;
    use uuid::Uuid;

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_frames_are_written() {
        let buffer = SharedBuffer::default();
        let exporter = PcapExporter::new(buffer.clone()).unwrap();
        exporter.flush().unwrap();
        let header_len = buffer.0.lock().len();
        assert!(header_len > 0);

        let frame = Frame {
            id: Uuid::nil(),
            number: 0,
            source: MacAddress([2, 0, 0, 0, 0, 1]),
            destination: MacAddress::BROADCAST,
            payload: FramePayload::Arp(ArpPacket {
                operation: ArpOperation::Request,
                sender_mac: MacAddress([2, 0, 0, 0, 0, 1]),
                sender_ip: Ipv4Addr::new(10, 0, 0, 1),
                target_mac: MacAddress::ZERO,
                target_ip: Ipv4Addr::new(10, 0, 0, 2),
            }),
        };
        exporter.track_frame(&frame).unwrap();
        exporter.flush().unwrap();

        assert_eq!(exporter.total_tracked_frames(), 1);
        // The enhanced packet block carries at least the 42 bytes of the frame
        assert!(buffer.0.lock().len() >= header_len + 42);
    }
}
