//! M3U playlist generation (SPEC_FULL.md §6): one `#EXTINF` line per enabled
//! channel, generalizing the teacher's XMLTV/Xtream join query into a
//! straight read of the `channels` table.

use diesel::prelude::*;

use crate::db::models::Channel;
use crate::db::schema::channels;
use crate::db::DbPooledConnection;

#[derive(Debug, Clone)]
pub struct M3uChannel {
    pub channel_number: String,
    pub name: String,
}

pub fn get_enabled_channels_for_m3u(conn: &mut DbPooledConnection) -> Result<Vec<M3uChannel>, diesel::result::Error> {
    let rows = channels::table
        .filter(channels::enabled.eq(1))
        .order(channels::channel_number.asc())
        .load::<Channel>(conn)?;

    Ok(rows
        .into_iter()
        .map(|c| M3uChannel {
            channel_number: c.channel_number,
            name: c.name,
        })
        .collect())
}

pub fn generate_m3u_playlist(conn: &mut DbPooledConnection, base_url: &str) -> Result<String, diesel::result::Error> {
    let channels = get_enabled_channels_for_m3u(conn)?;
    Ok(generate_m3u_from_channels(&channels, base_url))
}

pub fn generate_m3u_from_channels(channels: &[M3uChannel], base_url: &str) -> String {
    let estimated_size = 50 + (channels.len() * 150);
    let mut output = String::with_capacity(estimated_size);

    output.push_str("#EXTM3U\n");
    for channel in channels {
        generate_channel_entry(&mut output, channel, base_url);
    }
    output
}

fn generate_channel_entry(output: &mut String, channel: &M3uChannel, base_url: &str) {
    output.push_str(&format!(
        "#EXTINF:-1 tvg-id=\"{}\" tvg-name=\"{}\" tvg-chno=\"{}\",{}\n",
        escape_m3u_attribute(&channel.channel_number),
        escape_m3u_attribute(&channel.name),
        escape_m3u_attribute(&channel.channel_number),
        channel.name,
    ));
    output.push_str(&format!("{base_url}/iptv/channel/{}.ts\n", channel.channel_number));
}

fn escape_m3u_attribute(value: &str) -> String {
    value.replace('\"', "&quot;").replace('\n', " ").replace('\r', "")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(number: &str, name: &str) -> M3uChannel {
        M3uChannel {
            channel_number: number.to_string(),
            name: name.to_string(),
        }
    }

    #[test]
    fn empty_playlist_is_just_the_header() {
        let result = generate_m3u_from_channels(&[], "http://host:7777");
        assert_eq!(result.trim(), "#EXTM3U");
    }

    #[test]
    fn single_channel_entry_has_expected_shape() {
        let channels = vec![channel("7", "ESPN HD")];
        let result = generate_m3u_from_channels(&channels, "http://host:7777");

        assert!(result.starts_with("#EXTM3U\n"));
        assert!(result.contains("tvg-id=\"7\""));
        assert!(result.contains("tvg-chno=\"7\""));
        assert!(result.contains(",ESPN HD\n"));
        assert!(result.contains("http://host:7777/iptv/channel/7.ts\n"));
    }

    #[test]
    fn preserves_channel_order() {
        let channels = vec![channel("1", "A"), channel("2", "B"), channel("3", "C")];
        let result = generate_m3u_from_channels(&channels, "http://host:7777");

        let pos_a = result.find("A").unwrap();
        let pos_b = result.find("B").unwrap();
        let pos_c = result.find("C").unwrap();
        assert!(pos_a < pos_b && pos_b < pos_c);
    }

    #[test]
    fn quotes_in_name_are_escaped_in_attributes_but_not_after_the_comma() {
        let channels = vec![channel("1", "Channel \"One\"")];
        let result = generate_m3u_from_channels(&channels, "http://host:7777");

        assert!(result.contains("tvg-name=\"Channel &quot;One&quot;\""));
        assert!(result.contains(",Channel \"One\"\n"));
    }
}
