//! C9: projects the same timeline playout is consuming into XMLTV guide XML.
//!
//! Generalizes the teacher's `server::epg` module (`quick_xml::Writer`
//! generation, `format_xmltv_datetime`, synthetic-channel placeholder
//! programmes) by replacing its per-request SQL query window with a call
//! into the shared [`crate::timeline::TimelineBuilder`] against the
//! channel's persisted anchor, so the guide and the bytes ChannelStream will
//! transmit come from the same function call path (SPEC_FULL.md §4.7).

use std::io::Cursor;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use diesel::prelude::*;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use thiserror::Error;

use crate::channel_stream::{ChannelStreamError, PlayoutDataSource};
use crate::clock::Clock;
use crate::config::Config;
use crate::db::models::{Channel, MediaItemRow};
use crate::db::schema::channels;
use crate::db::DbPool;
use crate::timeline::{BuildOutcome, PlayoutItem, TimelineBuilder};

#[derive(Debug, Error)]
pub enum EpgError {
    #[error("database error: {0}")]
    Db(#[from] r2d2::Error),
    #[error("query error: {0}")]
    Query(#[from] diesel::result::Error),
    #[error("data source error: {0}")]
    DataSource(#[from] ChannelStreamError),
    #[error("xml generation error: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("utf8 encoding error: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

struct ProgrammeView {
    channel_number: String,
    item: PlayoutItem,
    metadata: Option<MediaItemRow>,
}

pub struct EpgProjector {
    pool: DbPool,
    data: Arc<dyn PlayoutDataSource>,
    clock: Arc<dyn Clock>,
    config: Arc<Config>,
}

impl EpgProjector {
    pub fn new(
        pool: DbPool,
        data: Arc<dyn PlayoutDataSource>,
        clock: Arc<dyn Clock>,
        config: Arc<Config>,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            data,
            clock,
            config,
        })
    }

    /// Generate the complete XMLTV document for every enabled channel, for
    /// `config.playout.build_days`.
    pub fn generate_xmltv(&self, generator_name: &str) -> Result<String, EpgError> {
        let now = self.clock.now();
        let horizon = Duration::days(self.config.playout.build_days.max(1) as i64);
        let channels = self.enabled_channels()?;

        let mut views: Vec<ProgrammeView> = Vec::new();
        for channel in &channels {
            let items = self.project_channel(channel, now, horizon)?;
            if items.is_empty() {
                views.push(ProgrammeView {
                    channel_number: channel.channel_number.clone(),
                    item: placeholder_item(channel, now, horizon),
                    metadata: None,
                });
                continue;
            }
            for item in items {
                let metadata = item.media_item_id.and_then(|id| self.data.media_metadata(id));
                views.push(ProgrammeView {
                    channel_number: channel.channel_number.clone(),
                    item,
                    metadata,
                });
            }
        }

        write_xmltv(&channels, &views, generator_name)
    }

    /// Items for one channel within `[now, now+horizon)`: the already
    /// materialized prefix plus whatever the builder produces from the
    /// anchor forward to cover the rest of the window.
    fn project_channel(
        &self,
        channel: &Channel,
        now: DateTime<Utc>,
        horizon: Duration,
    ) -> Result<Vec<PlayoutItem>, EpgError> {
        let horizon_end = now + horizon;
        let anchor = self.data.load_anchor(channel.id)?;

        let mut items = self
            .data
            .load_materialized_items(channel.id, now, horizon_end)?;

        if anchor.next_start < horizon_end {
            let remaining = horizon_end - anchor.next_start;
            let schedule_items = self.data.load_schedule_items(channel.id)?;
            if !schedule_items.is_empty() {
                let mut resolve_collection = |collection_type: &str, collection_ref: &str| {
                    self.data.resolve_collection(collection_type, collection_ref)
                };
                let mut resolve_filler = |media_item_id: i32| self.data.resolve_filler(media_item_id);

                let outcome = TimelineBuilder::build(
                    channel.id,
                    &schedule_items,
                    &anchor,
                    remaining,
                    &*self.clock,
                    &mut resolve_collection,
                    &mut resolve_filler,
                );

                if let BuildOutcome::Ok(new_items, new_anchor) | BuildOutcome::Warn(new_items, new_anchor, _) = outcome
                {
                    self.data.save_anchor_and_items(channel.id, &new_anchor, &new_items)?;
                    items.extend(new_items);
                }
            }
        }

        items.retain(|item| item.start_time < horizon_end && item.finish_time > now);
        items.sort_by_key(|item| item.start_time);
        items.dedup_by_key(|item| item.start_time);
        Ok(items)
    }

    fn enabled_channels(&self) -> Result<Vec<Channel>, EpgError> {
        let mut conn = self.pool.get()?;
        let rows = channels::table
            .filter(channels::enabled.eq(1))
            .order(channels::channel_number.asc())
            .load::<Channel>(&mut conn)?;
        Ok(rows)
    }
}

fn placeholder_item(channel: &Channel, now: DateTime<Utc>, horizon: Duration) -> PlayoutItem {
    PlayoutItem {
        schedule_item_id: None,
        media_item_id: None,
        title: format!("{} - No Schedule", channel.name),
        start_time: now,
        finish_time: now + horizon,
        filler_kind: Some("no_schedule".to_string()),
    }
}

fn format_xmltv_datetime(dt: DateTime<Utc>) -> String {
    dt.format("%Y%m%d%H%M%S +0000").to_string()
}

fn write_xmltv(
    channels: &[Channel],
    views: &[ProgrammeView],
    generator_name: &str,
) -> Result<String, EpgError> {
    let estimated_size = 500 + channels.len() * 300 + views.len() * 400;
    let buffer = Vec::with_capacity(estimated_size);
    let mut writer = Writer::new(Cursor::new(buffer));

    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    writer.write_event(Event::Text(BytesText::new("\n")))?;
    writer.write_event(Event::DocType(BytesText::from_escaped("tv SYSTEM \"xmltv.dtd\"")))?;
    writer.write_event(Event::Text(BytesText::new("\n")))?;

    let mut tv = BytesStart::new("tv");
    tv.push_attribute(("generator-info-name", generator_name));
    writer.write_event(Event::Start(tv))?;
    writer.write_event(Event::Text(BytesText::new("\n")))?;

    let mut channel_icons: std::collections::HashMap<&str, &str> = std::collections::HashMap::new();
    for view in views {
        let Some(thumbnail_url) = view
            .metadata
            .as_ref()
            .and_then(|media| media.thumbnail_url.as_deref())
            .filter(|url| !url.trim().is_empty())
        else {
            continue;
        };
        channel_icons
            .entry(view.channel_number.as_str())
            .or_insert(thumbnail_url);
    }

    for channel in channels {
        let icon = channel_icons.get(channel.channel_number.as_str()).copied();
        write_channel(&mut writer, channel, icon)?;
    }
    for view in views {
        write_programme(&mut writer, view)?;
    }

    writer.write_event(Event::End(BytesEnd::new("tv")))?;
    writer.write_event(Event::Text(BytesText::new("\n")))?;

    let result = writer.into_inner().into_inner();
    Ok(String::from_utf8(result)?)
}

fn write_channel<W: std::io::Write>(
    writer: &mut Writer<W>,
    channel: &Channel,
    icon: Option<&str>,
) -> Result<(), quick_xml::Error> {
    let mut ch = BytesStart::new("channel");
    ch.push_attribute(("id", channel.channel_number.as_str()));
    writer.write_event(Event::Start(ch))?;

    writer.write_event(Event::Start(BytesStart::new("display-name")))?;
    writer.write_event(Event::Text(BytesText::new(&channel.name)))?;
    writer.write_event(Event::End(BytesEnd::new("display-name")))?;

    writer.write_event(Event::Start(BytesStart::new("display-name")))?;
    writer.write_event(Event::Text(BytesText::new(&channel.channel_number)))?;
    writer.write_event(Event::End(BytesEnd::new("display-name")))?;

    if let Some(src) = icon {
        let mut icon_elem = BytesStart::new("icon");
        icon_elem.push_attribute(("src", src));
        writer.write_event(Event::Empty(icon_elem))?;
    }

    writer.write_event(Event::End(BytesEnd::new("channel")))?;
    writer.write_event(Event::Text(BytesText::new("\n")))?;
    Ok(())
}

fn write_programme<W: std::io::Write>(writer: &mut Writer<W>, view: &ProgrammeView) -> Result<(), quick_xml::Error> {
    let mut prog = BytesStart::new("programme");
    prog.push_attribute(("start", format_xmltv_datetime(view.item.start_time).as_str()));
    prog.push_attribute(("stop", format_xmltv_datetime(view.item.finish_time).as_str()));
    prog.push_attribute(("channel", view.channel_number.as_str()));
    writer.write_event(Event::Start(prog))?;

    let title = title_for(view);
    writer.write_event(Event::Start(BytesStart::new("title")))?;
    writer.write_event(Event::Text(BytesText::new(&title)))?;
    writer.write_event(Event::End(BytesEnd::new("title")))?;

    let desc = desc_for(view, &title);
    let mut desc_elem = BytesStart::new("desc");
    desc_elem.push_attribute(("lang", "en"));
    writer.write_event(Event::Start(desc_elem))?;
    writer.write_event(Event::Text(BytesText::new(&desc)))?;
    writer.write_event(Event::End(BytesEnd::new("desc")))?;

    if let Some(media) = &view.metadata {
        if let (Some(season), Some(episode)) = (media.season, media.episode) {
            writer.write_event(Event::Start(BytesStart::new("sub-title")))?;
            writer.write_event(Event::Text(BytesText::new(&format!("S{:02}E{:02}", season, episode))))?;
            writer.write_event(Event::End(BytesEnd::new("sub-title")))?;
        }

        if let Some(genres) = &media.genres {
            if !genres.trim().is_empty() {
                writer.write_event(Event::Start(BytesStart::new("category")))?;
                writer.write_event(Event::Text(BytesText::new(genres)))?;
                writer.write_event(Event::End(BytesEnd::new("category")))?;
            }
        }

        if let Some(cast) = &media.cast_members {
            if !cast.trim().is_empty() {
                writer.write_event(Event::Start(BytesStart::new("credits")))?;
                for actor in cast.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                    writer.write_event(Event::Start(BytesStart::new("actor")))?;
                    writer.write_event(Event::Text(BytesText::new(actor)))?;
                    writer.write_event(Event::End(BytesEnd::new("actor")))?;
                }
                writer.write_event(Event::End(BytesEnd::new("credits")))?;
            }
        }

        if let Some(air_date) = &media.air_date {
            if !air_date.trim().is_empty() {
                writer.write_event(Event::Start(BytesStart::new("date")))?;
                writer.write_event(Event::Text(BytesText::new(air_date)))?;
                writer.write_event(Event::End(BytesEnd::new("date")))?;
            }
        }

        if let (Some(season), Some(episode)) = (media.season, media.episode) {
            let mut onscreen = BytesStart::new("episode-num");
            onscreen.push_attribute(("system", "onscreen"));
            writer.write_event(Event::Start(onscreen))?;
            writer.write_event(Event::Text(BytesText::new(&format!("S{:02}E{:02}", season, episode))))?;
            writer.write_event(Event::End(BytesEnd::new("episode-num")))?;

            let mut ns = BytesStart::new("episode-num");
            ns.push_attribute(("system", "xmltv_ns"));
            writer.write_event(Event::Start(ns))?;
            writer.write_event(Event::Text(BytesText::new(&format!(
                "{}.{}.",
                (season - 1).max(0),
                (episode - 1).max(0)
            ))))?;
            writer.write_event(Event::End(BytesEnd::new("episode-num")))?;
        }
    }

    writer.write_event(Event::End(BytesEnd::new("programme")))?;
    writer.write_event(Event::Text(BytesText::new("\n")))?;
    Ok(())
}

/// Builds a non-empty synopsis from whatever descriptive text is on hand
/// (show title, genres), falling back to the programme's own title so the
/// element is never empty — some XMLTV clients treat a blank `<desc>` as
/// "Unknown Airing".
fn desc_for(view: &ProgrammeView, title: &str) -> String {
    if let Some(media) = &view.metadata {
        let mut parts: Vec<&str> = Vec::new();
        if let Some(show_title) = &media.show_title {
            let show_title = show_title.trim();
            if !show_title.is_empty() && show_title != title {
                parts.push(show_title);
            }
        }
        if let Some(genres) = &media.genres {
            let genres = genres.trim();
            if !genres.is_empty() {
                parts.push(genres);
            }
        }
        if !parts.is_empty() {
            return parts.join(" — ");
        }
    }
    title.to_string()
}

fn title_for(view: &ProgrammeView) -> String {
    if !view.item.title.trim().is_empty() {
        return view.item.title.clone();
    }
    if let Some(media) = &view.metadata {
        if !media.title.trim().is_empty() {
            return media.title.clone();
        }
        if let Some(url) = &media.url {
            if let Some(basename) = url.rsplit('/').next() {
                return basename.to_string();
            }
        }
    }
    "Untitled".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(number: &str) -> Channel {
        Channel {
            id: 1,
            channel_number: number.to_string(),
            name: "Test Channel".to_string(),
            enabled: 1,
            playout_mode: "continuous".to_string(),
            ffmpeg_profile_id: None,
            watermark_id: None,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    #[test]
    fn placeholder_spans_the_full_horizon() {
        let now = Utc::now();
        let horizon = Duration::hours(6);
        let ch = channel("100");
        let item = placeholder_item(&ch, now, horizon);
        assert_eq!(item.start_time, now);
        assert_eq!(item.finish_time, now + horizon);
    }

    #[test]
    fn title_falls_back_through_the_documented_chain() {
        let item = PlayoutItem {
            schedule_item_id: None,
            media_item_id: Some(1),
            title: String::new(),
            start_time: Utc::now(),
            finish_time: Utc::now(),
            filler_kind: None,
        };
        let view = ProgrammeView {
            channel_number: "100".to_string(),
            item,
            metadata: Some(MediaItemRow {
                id: 1,
                media_library_id: None,
                source: "local".to_string(),
                source_id: "x".to_string(),
                url: Some("/media/shows/example.mp4".to_string()),
                title: String::new(),
                duration_seconds: None,
                season: None,
                episode: None,
                show_title: None,
                genres: None,
                cast_members: None,
                air_date: None,
                rating: None,
                thumbnail_url: None,
                created_at: String::new(),
                updated_at: String::new(),
            }),
        };
        assert_eq!(title_for(&view), "example.mp4");
    }

    fn media_row(show_title: Option<&str>, genres: Option<&str>, thumbnail_url: Option<&str>) -> MediaItemRow {
        MediaItemRow {
            id: 1,
            media_library_id: None,
            source: "local".to_string(),
            source_id: "x".to_string(),
            url: None,
            title: "Episode Title".to_string(),
            duration_seconds: None,
            season: None,
            episode: None,
            show_title: show_title.map(str::to_string),
            genres: genres.map(str::to_string),
            cast_members: None,
            air_date: None,
            rating: None,
            thumbnail_url: thumbnail_url.map(str::to_string),
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    fn view_with(metadata: Option<MediaItemRow>) -> ProgrammeView {
        ProgrammeView {
            channel_number: "100".to_string(),
            item: PlayoutItem {
                schedule_item_id: None,
                media_item_id: Some(1),
                title: String::new(),
                start_time: Utc::now(),
                finish_time: Utc::now(),
                filler_kind: None,
            },
            metadata,
        }
    }

    #[test]
    fn desc_prefers_show_title_and_genres_over_the_bare_title() {
        let view = view_with(Some(media_row(Some("Mystery Theater"), Some("Drama, Mystery"), None)));
        let title = title_for(&view);
        assert_eq!(desc_for(&view, &title), "Mystery Theater — Drama, Mystery");
    }

    #[test]
    fn desc_falls_back_to_the_title_when_no_descriptive_text_is_available() {
        let view = view_with(Some(media_row(None, None, None)));
        let title = title_for(&view);
        assert_eq!(desc_for(&view, &title), title);
    }

    #[test]
    fn desc_falls_back_to_the_title_when_there_is_no_metadata_at_all() {
        let view = view_with(None);
        let title = title_for(&view);
        assert_eq!(desc_for(&view, &title), title);
    }

    #[test]
    fn write_channel_emits_an_icon_element_only_when_given_one() {
        let mut with_icon = Vec::new();
        let mut writer = Writer::new(Cursor::new(&mut with_icon));
        write_channel(&mut writer, &channel("100"), Some("http://example.com/logo.png")).unwrap();
        let xml = String::from_utf8(with_icon).unwrap();
        assert!(xml.contains(r#"<icon src="http://example.com/logo.png"/>"#));

        let mut without_icon = Vec::new();
        let mut writer = Writer::new(Cursor::new(&mut without_icon));
        write_channel(&mut writer, &channel("100"), None).unwrap();
        let xml = String::from_utf8(without_icon).unwrap();
        assert!(!xml.contains("<icon"));
    }

    #[test]
    fn write_xmltv_sources_the_channel_icon_from_the_first_thumbnail_it_finds() {
        let channels = vec![channel("100")];
        let views = vec![view_with(Some(media_row(None, None, Some("http://example.com/poster.jpg"))))];
        let xml = write_xmltv(&channels, &views, "test-generator").unwrap();
        assert!(xml.contains(r#"<icon src="http://example.com/poster.jpg"/>"#));
    }
}
