use crate::api::InputError;
use crate::params::Params;
use crate::time::TimeSource;

pub const TIME_PARAM: &str = "time";

/// Picks the request time: a non-zero `time` parameter, else the time embedded in
/// the payload, else the clock.
///
/// A `time` parameter set to zero (or left empty) means "now", the embedded time is
/// not consulted in that case.
pub fn resolve_time(
    params: &Params,
    embedded: Option<u64>,
    timesource: &(dyn TimeSource + Send + Sync),
) -> Result<u64, InputError> {
    match params.get(TIME_PARAM) {
        Some(raw) => match parse_time_param(raw)? {
            0 => Ok(timesource.current_time()),
            time => Ok(time),
        },
        None => Ok(embedded.unwrap_or_else(|| timesource.current_time())),
    }
}

fn parse_time_param(raw: &[u8]) -> Result<u64, InputError> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| InputError::InvalidTimeParameter(String::from_utf8_lossy(raw).into_owned()))?
        .trim();
    if text.is_empty() {
        return Ok(0);
    }
    text.parse::<u64>()
        .map_err(|_| InputError::InvalidTimeParameter(text.to_string()))
}

#[cfg(test)]
mod tests {
    use super::resolve_time;
    use crate::api::InputError;
    use crate::params::Params;
    use crate::time::FixedTime;

    const NOW: u64 = 1_700_000_000;

    fn clock() -> FixedTime {
        FixedTime { time: NOW }
    }

    #[test]
    fn parameter_wins() {
        let params = Params::parse(b"time=1293973200");
        assert_eq!(resolve_time(&params, Some(5), &clock()).unwrap(), 1293973200);
    }

    #[test]
    fn zero_parameter_means_now() {
        let params = Params::parse(b"time=0");
        assert_eq!(resolve_time(&params, Some(5), &clock()).unwrap(), NOW);
        let params = Params::parse(b"time=");
        assert_eq!(resolve_time(&params, None, &clock()).unwrap(), NOW);
    }

    #[test]
    fn embedded_time_without_parameter() {
        let params = Params::default();
        assert_eq!(resolve_time(&params, Some(5), &clock()).unwrap(), 5);
        assert_eq!(resolve_time(&params, None, &clock()).unwrap(), NOW);
    }

    #[test]
    fn garbage_parameter_is_rejected() {
        for raw in [&b"time=soon"[..], b"time=-1", b"time=1.5", b"time=%FF"] {
            let params = Params::parse(raw);
            assert!(matches!(
                resolve_time(&params, None, &clock()),
                Err(InputError::InvalidTimeParameter(_))
            ));
        }
    }
}
