//! XML generation and parsing for libvirt definitions.
//!
//! Domain, volume and snapshot documents are produced by string building.
//! Reading and rewriting existing domain XML (for clones, exports and
//! status queries) goes through `quick-xml` so that nothing depends on the
//! exact formatting libvirt happens to emit.

use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use rand::Rng;
use std::io::Cursor;

use crate::error::{HypervisorError, Result};
use crate::guest_os::GuestOSProfile;
use crate::types::*;

/// Namespace of the metadata block carrying the OS profile identifier.
pub const METADATA_NS: &str = "http://virtpilot.dev/xmlns/vm/1.0";

fn xml_err(e: impl std::fmt::Display) -> HypervisorError {
    HypervisorError::XmlError(e.to_string())
}

/// Builder for libvirt domain XML.
pub struct DomainXmlBuilder<'a> {
    config: &'a VmConfig,
    profile: GuestOSProfile,
}

impl<'a> DomainXmlBuilder<'a> {
    /// Create a new XML builder, picking the Guest OS profile from the
    /// config's OS variant.
    pub fn new(config: &'a VmConfig) -> Self {
        let profile = GuestOSProfile::for_family(config.guest_os());
        Self { config, profile }
    }

    /// Create a new XML builder with a custom Guest OS profile.
    pub fn with_profile(config: &'a VmConfig, profile: GuestOSProfile) -> Self {
        Self { config, profile }
    }

    /// Build the domain XML string.
    pub fn build(&self) -> String {
        let mut xml = String::new();

        xml.push_str(&format!(
            r#"<domain type='kvm'>
  <name>{}</name>
  <metadata>
    <virtpilot:vm xmlns:virtpilot='{}'>
      <virtpilot:os-variant>{}</virtpilot:os-variant>
    </virtpilot:vm>
  </metadata>
  <memory unit='MiB'>{}</memory>
  <vcpu placement='static'>{}</vcpu>
"#,
            escape(&self.config.name),
            METADATA_NS,
            escape(&self.config.os_variant),
            self.config.memory_mib,
            self.config.vcpus
        ));

        xml.push_str(&self.build_os_section());
        xml.push_str(&self.build_features_section());
        // host-model keeps the VM migratable between unlike CPUs
        xml.push_str("  <cpu mode='host-model'/>\n");
        xml.push_str(&self.build_clock_section());
        xml.push_str(
            r#"  <on_poweroff>destroy</on_poweroff>
  <on_reboot>restart</on_reboot>
  <on_crash>destroy</on_crash>
"#,
        );

        xml.push_str("  <devices>\n");
        xml.push_str(&self.build_disk());
        xml.push_str(&self.build_cdrom());
        xml.push_str(&self.build_nic());
        xml.push_str(&self.build_graphics());
        xml.push_str("  </devices>\n");
        xml.push_str("</domain>\n");

        xml
    }

    fn build_os_section(&self) -> String {
        // Boot from the install media first when one is attached
        let boot = if self.config.iso_path.is_some() {
            "    <boot dev='cdrom'/>\n    <boot dev='hd'/>\n"
        } else {
            "    <boot dev='hd'/>\n"
        };

        format!(
            "  <os>\n    <type arch='x86_64' machine='q35'>hvm</type>\n{}  </os>\n",
            boot
        )
    }

    fn build_features_section(&self) -> String {
        let mut xml = String::from("  <features>\n    <acpi/>\n    <apic/>\n");

        if self.profile.hyperv {
            xml.push_str(
                r#"    <hyperv>
      <relaxed state='on'/>
      <vapic state='on'/>
      <spinlocks state='on' retries='8191'/>
    </hyperv>
"#,
            );
        }

        xml.push_str("  </features>\n");
        xml
    }

    fn build_clock_section(&self) -> String {
        format!(
            r#"  <clock offset='{}'>
    <timer name='rtc' tickpolicy='catchup'/>
    <timer name='pit' tickpolicy='delay'/>
    <timer name='hpet' present='{}'/>
  </clock>
"#,
            if self.profile.family.is_windows() { "localtime" } else { "utc" },
            if self.profile.hpet { "yes" } else { "no" }
        )
    }

    fn build_disk(&self) -> String {
        let bus = self.profile.disk_bus;
        format!(
            r#"    <disk type='file' device='disk'>
      <driver name='qemu' type='{}'/>
      <source file='{}'/>
      <target dev='{}a' bus='{}'/>
    </disk>
"#,
            self.config.disk.format.as_str(),
            escape(&self.config.disk.path),
            bus.device_prefix(),
            bus.as_str()
        )
    }

    fn build_cdrom(&self) -> String {
        match &self.config.iso_path {
            Some(iso) => format!(
                r#"    <disk type='file' device='cdrom'>
      <driver name='qemu' type='raw'/>
      <source file='{}'/>
      <target dev='sdb' bus='sata'/>
      <readonly/>
    </disk>
"#,
                escape(iso)
            ),
            None => String::new(),
        }
    }

    fn build_nic(&self) -> String {
        format!(
            r#"    <interface type='bridge'>
      <mac address='{}'/>
      <source bridge='{}'/>
      <model type='{}'/>
    </interface>
"#,
            generate_mac_address(),
            escape(&self.config.bridge),
            self.profile.nic_model.as_str()
        )
    }

    fn build_graphics(&self) -> String {
        format!(
            r#"    <graphics type='vnc' port='-1' autoport='yes' listen='0.0.0.0'>
      <listen type='address' address='0.0.0.0'/>
    </graphics>
    <video>
      <model type='{}' primary='yes'/>
    </video>
"#,
            self.profile.video_model
        )
    }
}

/// Generate a random MAC address in the QEMU/KVM range (52:54:00:xx:xx:xx).
pub fn generate_mac_address() -> String {
    let mut rng = rand::thread_rng();
    format!(
        "52:54:00:{:02x}:{:02x}:{:02x}",
        rng.gen::<u8>(),
        rng.gen::<u8>(),
        rng.gen::<u8>()
    )
}

/// Storage volume definition for a VM boot disk.
pub fn volume_xml(name: &str, size_gib: u64, format: DiskFormat) -> String {
    format!(
        r#"<volume>
  <name>{}.{}</name>
  <capacity unit='G'>{}</capacity>
  <target>
    <format type='{}'/>
  </target>
</volume>
"#,
        escape(name),
        format.as_str(),
        size_gib,
        format.as_str()
    )
}

/// Snapshot definition. Disk-only snapshots skip the memory image.
pub fn snapshot_xml(name: &str, include_memory: bool) -> String {
    format!(
        "<domainsnapshot>\n  <name>{}</name>\n  <memory snapshot='{}'/>\n</domainsnapshot>\n",
        escape(name),
        if include_memory { "internal" } else { "no" }
    )
}

/// Rewrite a domain definition so it can be defined as a copy.
///
/// The domain `<name>` becomes `new_name`, the `<uuid>` and every NIC
/// `<mac>` are dropped so libvirt generates fresh ones, and any disk source
/// pointing at `old_disk` is pointed at `new_disk`.
pub fn rewrite_for_clone(xml: &str, new_name: &str, old_disk: &str, new_disk: &str) -> Result<String> {
    let mut reader = Reader::from_str(xml);
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    let mut path: Vec<String> = Vec::new();
    let mut skip_depth = 0usize;

    loop {
        let event = reader.read_event().map_err(xml_err)?;

        if skip_depth > 0 {
            match event {
                Event::Start(_) => skip_depth += 1,
                Event::End(_) => skip_depth -= 1,
                Event::Eof => break,
                _ => {}
            }
            continue;
        }

        match event {
            Event::Eof => break,
            Event::Start(e) if is_dropped_on_clone(&e, &path) => {
                skip_depth = 1;
            }
            Event::Empty(e) if is_dropped_on_clone(&e, &path) => {}
            Event::Start(e) => {
                let e = retarget_source(e, old_disk, new_disk)?;
                path.push(local_name(&e));
                writer.write_event(Event::Start(e)).map_err(xml_err)?;
            }
            Event::Empty(e) => {
                let e = retarget_source(e, old_disk, new_disk)?;
                writer.write_event(Event::Empty(e)).map_err(xml_err)?;
            }
            Event::End(e) => {
                path.pop();
                writer.write_event(Event::End(e)).map_err(xml_err)?;
            }
            Event::Text(_) if path == ["domain", "name"] => {
                writer
                    .write_event(Event::Text(BytesText::new(new_name)))
                    .map_err(xml_err)?;
            }
            other => writer.write_event(other).map_err(xml_err)?,
        }
    }

    String::from_utf8(writer.into_inner().into_inner()).map_err(xml_err)
}

fn is_dropped_on_clone(e: &BytesStart<'_>, path: &[String]) -> bool {
    let name = local_name(e);
    (name == "uuid" && path == ["domain"])
        || (name == "mac" && path.last().map(String::as_str) == Some("interface"))
}

fn retarget_source<'a>(e: BytesStart<'a>, old_disk: &str, new_disk: &str) -> Result<BytesStart<'a>> {
    if local_name(&e) != "source" || attribute(&e, "file")?.as_deref() != Some(old_disk) {
        return Ok(e);
    }

    let mut rewritten = BytesStart::new("source");
    for attr in e.attributes() {
        let attr = attr.map_err(xml_err)?;
        if attr.key.as_ref() == b"file" {
            rewritten.push_attribute(("file", new_disk));
        } else {
            rewritten.push_attribute(attr);
        }
    }
    Ok(rewritten)
}

fn local_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).into_owned()
}

fn attribute(e: &BytesStart<'_>, key: &str) -> Result<Option<String>> {
    for attr in e.attributes() {
        let attr = attr.map_err(xml_err)?;
        if attr.key.as_ref() == key.as_bytes() {
            return Ok(Some(attr.unescape_value().map_err(xml_err)?.into_owned()));
        }
    }
    Ok(None)
}

/// The parts of a domain definition the control service cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomainSummary {
    pub name: String,
    pub memory_mib: u64,
    pub vcpus: u32,
    /// Boot disk image
    pub disk_path: Option<String>,
    /// Attached install media
    pub iso_path: Option<String>,
    pub bridge: Option<String>,
    pub os_variant: Option<String>,
    /// Assigned VNC port, present only while the VM is active
    pub vnc_port: Option<u16>,
}

impl DomainSummary {
    /// Parse a domain XML document.
    pub fn parse(xml: &str) -> Result<Self> {
        let mut reader = Reader::from_str(xml);
        let mut summary = DomainSummary::default();
        let mut path: Vec<String> = Vec::new();
        let mut disk_device: Option<String> = None;
        let mut memory_unit = String::from("KiB");

        loop {
            let event = reader.read_event().map_err(xml_err)?;
            let (e, empty) = match event {
                Event::Eof => break,
                Event::Start(e) => (e, false),
                Event::Empty(e) => (e, true),
                Event::End(_) => {
                    if path.pop().as_deref() == Some("disk") {
                        disk_device = None;
                    }
                    continue;
                }
                Event::Text(t) => {
                    let text = t.unescape().map_err(xml_err)?;
                    summary.apply_text(&path, text.trim(), &memory_unit)?;
                    continue;
                }
                _ => continue,
            };

            let name = local_name(&e);
            match name.as_str() {
                "disk" => disk_device = attribute(&e, "device")?,
                "memory" if path == ["domain"] => {
                    if let Some(unit) = attribute(&e, "unit")? {
                        memory_unit = unit;
                    }
                }
                "source" if path.last().map(String::as_str) == Some("disk") => {
                    let file = attribute(&e, "file")?;
                    match disk_device.as_deref() {
                        Some("disk") if summary.disk_path.is_none() => summary.disk_path = file,
                        Some("cdrom") if summary.iso_path.is_none() => summary.iso_path = file,
                        _ => {}
                    }
                }
                "source" if path.last().map(String::as_str) == Some("interface") => {
                    if summary.bridge.is_none() {
                        summary.bridge = attribute(&e, "bridge")?;
                    }
                }
                "graphics" if attribute(&e, "type")?.as_deref() == Some("vnc") => {
                    summary.vnc_port = attribute(&e, "port")?
                        .and_then(|p| p.parse::<i32>().ok())
                        .filter(|p| *p > 0)
                        .and_then(|p| u16::try_from(p).ok());
                }
                _ => {}
            }

            if !empty {
                path.push(name);
            }
        }

        if summary.name.is_empty() {
            return Err(HypervisorError::XmlError("domain has no name".to_string()));
        }
        Ok(summary)
    }

    fn apply_text(&mut self, path: &[String], text: &str, memory_unit: &str) -> Result<()> {
        if text.is_empty() {
            return Ok(());
        }

        match path {
            [d, n] if d == "domain" && n == "name" => self.name = text.to_string(),
            [d, n] if d == "domain" && n == "vcpu" => {
                self.vcpus = text.parse().map_err(xml_err)?;
            }
            [d, n] if d == "domain" && n == "memory" => {
                let value: u64 = text.parse().map_err(xml_err)?;
                self.memory_mib = match memory_unit {
                    "b" | "bytes" => value / (1024 * 1024),
                    "KiB" | "k" => value / 1024,
                    "GiB" | "G" => value * 1024,
                    _ => value,
                };
            }
            [.., last] if last == "os-variant" => self.os_variant = Some(text.to_string()),
            _ => {}
        }
        Ok(())
    }

    /// Rebuild a VM configuration from the summary.
    pub fn to_config(&self, disk_gib: u64) -> VmConfig {
        let mut config = VmConfig::new(self.name.clone())
            .with_memory(self.memory_mib)
            .with_cpu(self.vcpus)
            .with_disk_size(disk_gib);

        if let Some(path) = &self.disk_path {
            config = config.with_disk_path(path.clone());
        }
        if let Some(iso) = &self.iso_path {
            config = config.with_iso(iso.clone());
        }
        if let Some(bridge) = &self.bridge {
            config = config.with_bridge(bridge.clone());
        }
        if let Some(os) = &self.os_variant {
            config = config.with_os_variant(os.clone());
        }
        config
    }
}
