//! Offline geolocation used to fill gaps in verification records

use crate::proxy::models::VerificationRecord;
use crate::Result;
use maxminddb::{geoip2, Reader};
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

/// Location fields an MMDB City lookup can provide
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GeoLocation {
    pub country_code: Option<String>,
    pub city_name: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub timezone: Option<String>,
}

impl GeoLocation {
    pub fn is_empty(&self) -> bool {
        self.country_code.is_none()
            && self.city_name.is_none()
            && self.latitude.is_none()
            && self.longitude.is_none()
            && self.timezone.is_none()
    }

    /// Copy into the record only what the record is missing
    pub fn fill(&self, record: &mut VerificationRecord) {
        if record.country_code.is_none() {
            record.country_code = self.country_code.clone();
        }
        if record.city.is_none() {
            record.city = self.city_name.clone();
        }
        if record.latitude.is_none() {
            record.latitude = self.latitude;
        }
        if record.longitude.is_none() {
            record.longitude = self.longitude;
        }
        if record.timezone.is_none() {
            record.timezone = self.timezone.clone();
        }
    }
}

/// GeoLocator for looking up IP addresses in MMDB databases
#[derive(Clone)]
pub struct GeoLocator {
    reader: Arc<Reader<Vec<u8>>>,
}

impl GeoLocator {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = Reader::open_readfile(path)?;
        Ok(Self {
            reader: Arc::new(reader),
        })
    }

    pub fn lookup(&self, ip_str: &str) -> Result<GeoLocation> {
        let ip: IpAddr = ip_str.parse()?;
        let lookup_result = self.reader.lookup(ip)?;

        let city: Option<geoip2::City> = lookup_result.decode()?;
        let Some(city) = city else {
            return Ok(GeoLocation::default());
        };

        Ok(GeoLocation {
            country_code: city.country.iso_code.map(String::from),
            city_name: city.city.names.english.map(String::from),
            latitude: city.location.latitude,
            longitude: city.location.longitude,
            timezone: city.location.time_zone.map(String::from),
        })
    }

    /// Fill missing geography on a record from the egress address
    pub fn enrich(&self, record: &mut VerificationRecord, egress: &str) {
        match self.lookup(egress) {
            Ok(location) if !location.is_empty() => location.fill(record),
            Ok(_) => {}
            Err(e) => tracing::debug!(address = egress, "geo lookup failed: {:#}", e),
        }
    }
}
