use mdns_sd::{ServiceDaemon, ServiceInfo};

// ── Constants ───────────────────────────────────────────────────────────────

/// mDNS service type nearby whist sessions are advertised under.
pub const SERVICE_TYPE: &str = "_whist._tcp.local.";

/// What a nearby device sees before it connects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub session_name: String,
    pub host_name: String,
    pub host_email: String,
    pub port: u16,
    pub players: usize,
    pub max_players: usize,
}

impl Advertisement {
    fn txt_properties(&self) -> Vec<(&'static str, String)> {
        vec![
            ("name", self.session_name.clone()),
            ("host", self.host_name.clone()),
            ("email", self.host_email.clone()),
            ("players", self.players.to_string()),
            ("max_players", self.max_players.to_string()),
        ]
    }

    fn service_info(&self) -> Result<ServiceInfo, mdns_sd::Error> {
        let instance_name = sanitize_instance_name(&self.session_name);
        let props = self.txt_properties();
        let txt: Vec<(&str, &str)> = props.iter().map(|(k, v)| (*k, v.as_str())).collect();
        Ok(ServiceInfo::new(
            SERVICE_TYPE,
            &instance_name,
            &format!("{instance_name}.local."),
            "",
            self.port,
            &txt[..],
        )?
        .enable_addr_auto())
    }
}

// ── MdnsBroadcaster ────────────────────────────────────────────────────────

/// Advertises a hosted session on the LAN so nearby devices can find it.
pub struct MdnsBroadcaster {
    daemon: ServiceDaemon,
    service_fullname: String,
    port: u16,
}

impl MdnsBroadcaster {
    pub fn register(advert: &Advertisement) -> Result<Self, mdns_sd::Error> {
        let daemon = ServiceDaemon::new()?;
        let service_info = advert.service_info()?;
        let service_fullname = service_info.get_fullname().to_owned();

        daemon.register(service_info)?;
        log::info!(
            "mDNS: advertising \"{}\" as {service_fullname}",
            advert.session_name
        );

        Ok(Self {
            daemon,
            service_fullname,
            port: advert.port,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Re-register with a fresh player count.
    pub fn update(&self, advert: &Advertisement) -> Result<(), mdns_sd::Error> {
        self.daemon.register(advert.service_info()?)?;
        log::debug!("mDNS: player count now {}", advert.players);
        Ok(())
    }

    pub fn unregister(self) -> Result<(), mdns_sd::Error> {
        log::info!("mDNS: unregistering {}", self.service_fullname);
        let receiver = self.daemon.unregister(&self.service_fullname)?;
        let _ = receiver.recv_timeout(std::time::Duration::from_secs(2));
        self.daemon.shutdown()?;
        Ok(())
    }
}

/// mDNS instance names are at most 63 bytes and should avoid dots.
fn sanitize_instance_name(name: &str) -> String {
    let mut cleaned: String = name
        .chars()
        .map(|c| if c == '.' { '-' } else { c })
        .collect();
    if cleaned.len() > 63 {
        let mut cut = 63;
        while !cleaned.is_char_boundary(cut) {
            cut -= 1;
        }
        cleaned.truncate(cut);
    }
    cleaned
}

// ── Tests ───────────────────────────────────────────────────────────────────
