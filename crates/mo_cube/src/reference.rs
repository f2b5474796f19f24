use crate::Cube3;

/// Spatial reference tag carried by every cube that describes real geometry.
///
/// The cache itself never reprojects payloads; the tag exists so lookups only
/// ever match entries from the same reference system, and so the geographic
/// placement strategy can map centroids into lon/lat for its space-filling
/// curve.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Srs {
    /// WGS84 geographic coordinates (EPSG:4326), degrees.
    LatLon,
    /// Spherical web mercator (EPSG:3857), meters.
    WebMercator,
    /// Nominal geostationary view of the Meteosat second generation
    /// satellites, meters from the sub-satellite point.
    GeosMsg,
    /// Anything else; matched by code, never reprojected.
    Other(u32),
}

impl Srs {
    pub const LATLON_CODE: u32 = 4326;
    pub const WEBMERCATOR_CODE: u32 = 3857;
    pub const GEOSMSG_CODE: u32 = 0x9E05;

    pub fn from_code(code: u32) -> Self {
        match code {
            Self::LATLON_CODE => Self::LatLon,
            Self::WEBMERCATOR_CODE => Self::WebMercator,
            Self::GEOSMSG_CODE => Self::GeosMsg,
            other => Self::Other(other),
        }
    }

    pub fn code(&self) -> u32 {
        match self {
            Self::LatLon => Self::LATLON_CODE,
            Self::WebMercator => Self::WEBMERCATOR_CODE,
            Self::GeosMsg => Self::GEOSMSG_CODE,
            Self::Other(code) => *code,
        }
    }

    /// Maps a coordinate pair into (lon, lat) degrees.
    ///
    /// Web mercator uses the exact spherical inverse. The geostationary view
    /// uses a scan-angle linearization around the sub-satellite point, which
    /// preserves ordering and locality, which is all the placement strategy needs.
    /// Unknown systems clamp into the lon/lat rectangle.
    pub fn to_lonlat(&self, x: f64, y: f64) -> (f64, f64) {
        const EARTH_RADIUS: f64 = 6_378_137.0;
        const GEOS_HEIGHT: f64 = 35_785_831.0;

        match self {
            Self::LatLon => (x.clamp(-180.0, 180.0), y.clamp(-90.0, 90.0)),
            Self::WebMercator => {
                let lon = (x / EARTH_RADIUS).to_degrees();
                let lat = ((y / EARTH_RADIUS).exp().atan() * 2.0 - std::f64::consts::FRAC_PI_2)
                    .to_degrees();
                (lon.clamp(-180.0, 180.0), lat.clamp(-90.0, 90.0))
            }
            Self::GeosMsg => {
                let lon = (x / GEOS_HEIGHT).to_degrees();
                let lat = (y / GEOS_HEIGHT).to_degrees();
                (lon.clamp(-180.0, 180.0), lat.clamp(-90.0, 90.0))
            }
            Self::Other(_) => (x.clamp(-180.0, 180.0), y.clamp(-90.0, 90.0)),
        }
    }
}

/// How the time axis of a cube is to be interpreted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimeKind {
    /// No meaningful temporal reference.
    Unreferenced,
    /// Seconds since the unix epoch.
    Unix,
}

impl TimeKind {
    pub fn from_tag(tag: u8) -> Self {
        match tag {
            1 => Self::Unix,
            _ => Self::Unreferenced,
        }
    }

    pub fn tag(&self) -> u8 {
        match self {
            Self::Unreferenced => 0,
            Self::Unix => 1,
        }
    }
}

/// A [`Cube3`] plus the reference tags needed to interpret it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundsCube {
    pub cube: Cube3,
    pub srs: Srs,
    pub time_kind: TimeKind,
}

impl BoundsCube {
    pub fn new(cube: Cube3, srs: Srs, time_kind: TimeKind) -> Self {
        Self {
            cube,
            srs,
            time_kind,
        }
    }

    /// Tags must agree for two cubes to be comparable at all.
    #[inline]
    pub fn same_reference(&self, other: &Self) -> bool {
        self.srs == other.srs && self.time_kind == other.time_kind
    }

    /// Spatial centroid mapped into (lon, lat) degrees.
    pub fn centroid_lonlat(&self) -> (f64, f64) {
        let c = self.cube.centroid();
        self.srs.to_lonlat(c[0], c[1])
    }
}

impl std::fmt::Display for BoundsCube {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} @srs:{}", self.cube, self.srs.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn srs_codes_round_trip() {
        for srs in [
            Srs::LatLon,
            Srs::WebMercator,
            Srs::GeosMsg,
            Srs::Other(31467),
        ] {
            assert_eq!(Srs::from_code(srs.code()), srs);
        }
    }

    #[test]
    fn geos_linearization_is_monotone_and_bounded() {
        let (lon_w, _) = Srs::GeosMsg.to_lonlat(-3_000_000.0, 0.0);
        let (lon_0, lat_0) = Srs::GeosMsg.to_lonlat(0.0, 0.0);
        let (lon_e, _) = Srs::GeosMsg.to_lonlat(3_000_000.0, 0.0);
        assert!(lon_w < lon_0 && lon_0 < lon_e);
        assert!(lon_0.abs() < 1e-9 && lat_0.abs() < 1e-9);
        // Even far outside the disk the result stays in the lon/lat square.
        let (lon, lat) = Srs::GeosMsg.to_lonlat(1e12, -1e12);
        assert!((-180.0..=180.0).contains(&lon) && (-90.0..=90.0).contains(&lat));
    }

    #[test]
    fn webmercator_inverse_hits_known_points() {
        let (lon, lat) = Srs::WebMercator.to_lonlat(0.0, 0.0);
        assert!(lon.abs() < 1e-9 && lat.abs() < 1e-9);

        // 20037508.34 meters is the ±180° edge of the mercator square.
        let (lon, _) = Srs::WebMercator.to_lonlat(20_037_508.34, 0.0);
        assert!((lon - 180.0).abs() < 1e-4);

        // Latitude grows monotonically with y.
        let (_, lat_lo) = Srs::WebMercator.to_lonlat(0.0, 1_000_000.0);
        let (_, lat_hi) = Srs::WebMercator.to_lonlat(0.0, 5_000_000.0);
        assert!(0.0 < lat_lo && lat_lo < lat_hi && lat_hi < 90.0);
    }
}
