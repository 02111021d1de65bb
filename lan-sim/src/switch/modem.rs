use crate::context::SimulationContext;
use crate::network::cable::Port;
use crate::task_group::TaskGroup;
use anyhow::bail;
use parking_lot::Mutex;
use std::sync::Arc;

/// A two-port repeater: every frame received on one port is sent out on the other
pub struct Modem {
    id: Arc<str>,
    ports: [Arc<Port>; 2],
    context: Arc<SimulationContext>,
    tasks: Mutex<Option<TaskGroup>>,
}

impl Modem {
    pub(crate) fn new(id: Arc<str>, context: Arc<SimulationContext>) -> Self {
        let ports = [Port::new(id.clone(), 0), Port::new(id.clone(), 1)];
        Self {
            id,
            ports,
            context,
            tasks: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &Arc<str> {
        &self.id
    }

    pub fn ports(&self) -> &[Arc<Port>] {
        &self.ports
    }

    pub fn is_running(&self) -> bool {
        self.tasks.lock().is_some()
    }

    pub(crate) fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        let mut tasks = self.tasks.lock();
        if tasks.is_some() {
            bail!("modem `{}` is already running", self.id);
        }

        let mut group = TaskGroup::new(self.id.clone());
        for (ingress, egress) in [(0, 1), (1, 0)] {
            let modem = self.clone();
            let token = group.token().clone();
            modem.ports[ingress].clear_inbound();
            group.spawn("modem port", async move {
                let ingress = &modem.ports[ingress];
                let egress = &modem.ports[egress];
                while let Some(frames) = token.run_until_cancelled(ingress.next_frames()).await {
                    for frame in frames {
                        modem.context.tracer.track_frame_received(&modem.id, &frame);
                        if !egress.is_blocked() {
                            egress.send(frame);
                        }
                    }
                }
            });
        }

        *tasks = Some(group);
        Ok(())
    }

    pub(crate) async fn stop(&self) -> anyhow::Result<()> {
        let group = self.tasks.lock().take();
        match group {
            Some(group) => group.shutdown().await,
            None => Ok(()),
        }
    }
}
